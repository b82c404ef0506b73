//! Administers an in-process adapter model the way the web console does.
//!
//! ```sh
//! RUST_LOG=debug REQUEST_TIMEOUT_MS=2000 cargo run -p adapter-client --example model_console
//! ```

use std::sync::Arc;

use adapter_client::{
    serve, BoundedPollEventCollector, ClientConfig, EndpointConfig, EventCountReporter,
    LocalBroker, LocalConnector, MetricsDispatcher, MetricsRecorder, ModelClient,
    ModelController, PollEventCounter, ServiceConfig, SessionEstablisher, SessionGate,
    SystemClock, TopicAddFailReason, TopicCreationEventCounter, TopicType,
};
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,adapter_client=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = ClientConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(server = %config.server_url(), channel = %config.model_channel, "Configuration loaded");

    // The adapter's side: a model store answering on the model channel.
    let broker = LocalBroker::new();
    let _server = serve(broker.clone(), config.model_channel.clone(), ModelController::new());

    let establisher = Arc::new(SessionEstablisher::new(LocalConnector::new(broker)));
    let gate = SessionGate::new(establisher.clone(), || {
        tracing::warn!("No session, the console would show the login view");
    });

    // Not logged in yet.
    if !gate.can_proceed().await {
        tracing::info!(principal = ?config.principal, "Logging in");
        establisher
            .establish()
            .await
            .context("Failed to establish session")?;
    }
    anyhow::ensure!(gate.can_proceed().await, "session gate still closed after login");

    let client = ModelClient::with_channel(
        establisher.clone(),
        config.model_channel.clone(),
        config.channel_options(),
    );

    client
        .create_service(ServiceConfig::new(
            "weather",
            "api.example.com",
            443,
            true,
            60_000,
            "rest/weather",
        ))
        .await
        .context("Failed to create service")?;
    client
        .create_endpoint(
            "weather",
            EndpointConfig {
                name: "forecast".into(),
                url: "/v1/forecast".into(),
                topic_path: "forecast".into(),
                produces: "json".into(),
            },
        )
        .await
        .context("Failed to create endpoint")?;

    for service in client.list_services().await.context("Failed to list services")? {
        tracing::info!(
            service = %service.name,
            endpoints = service.endpoints.len(),
            root = %service.topic_path_root,
            "Service configured"
        );
    }

    // What the adapter would record while running that service.
    let dispatcher = Arc::new(MetricsDispatcher::new());
    let polls = Arc::new(PollEventCounter::new());
    let topic_creations = Arc::new(TopicCreationEventCounter::new());
    let history = Arc::new(BoundedPollEventCollector::with_limit(
        config.metrics_event_limit,
    ));
    dispatcher.add_poll_listener(polls.clone());
    dispatcher.add_poll_listener(history.clone());
    dispatcher.add_topic_creation_listener(topic_creations.clone());
    let recorder = MetricsRecorder::new(SystemClock, dispatcher);

    let reporter = EventCountReporter::new(
        polls,
        topic_creations,
        config.metrics_report_interval,
    );
    reporter.start();

    let attempt = recorder.begin_topic_creation(
        "rest/weather/forecast",
        TopicType::infer_from_content_type(Some("application/json")),
        0,
    );
    recorder.topic_created(attempt);
    let attempt = recorder.begin_topic_creation("rest/weather/forecast", TopicType::Json, 0);
    recorder.topic_creation_failed(attempt, TopicAddFailReason::Exists);

    for _ in 0..3 {
        let attempt = recorder.begin_poll("https://api.example.com:443/v1/forecast");
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        recorder.poll_succeeded(attempt, 200, 2048);
    }

    reporter.report();
    tracing::info!(
        p90_ms = ?history.successful_request_time_90th_percentile(),
        "Successful poll latency"
    );
    reporter.close();

    client
        .delete_service("weather")
        .await
        .context("Failed to delete service")?;
    tracing::info!(
        remaining = client.list_services().await?.len(),
        "Service deleted"
    );

    Ok(())
}
