//! The adapter's configuration model and the request/response facade over it.
//!
//! The adapter's server keeps its [`Model`] behind a request channel. A
//! [`ModelClient`] talks to it with [`ModelRequest`]s; a [`ModelController`]
//! is the serving side, used in-process and in tests.
//!
//! | Request            | Fields                          | Response       |
//! |--------------------|---------------------------------|----------------|
//! | `list-services`    |                                 | service list   |
//! | `create-service`   | `service`                       | `{}`           |
//! | `delete-service`   | `serviceName`                   | `{}`           |
//! | `create-endpoint`  | `serviceName`, `endpoint`       | `{}`           |
//! | `delete-endpoint`  | `serviceName`, `endpointName`   | `{}`           |
//!
//! Deleting something that does not exist is acknowledged like any other
//! delete. A request with no `type`, or one the controller does not know, is
//! acknowledged without effect.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::channel::{ChannelOptions, RequestChannel};
use crate::error::{ClientError, RequestError};
use crate::local::Responder;
use crate::session::{Connector, SessionEstablisher, SessionHandle};
use crate::transport::Transport;

/// Channel the adapter serves its model on.
pub const DEFAULT_MODEL_CHANNEL: &str = "adapter/rest/model/store";

/// The adapter's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// The REST services to poll.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Model {
    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|service| service.name == name)
    }

    fn service_mut(&mut self, name: &str) -> Option<&mut ServiceConfig> {
        self.services.iter_mut().find(|service| service.name == name)
    }
}

/// A REST service polled by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// Endpoints polled on this service.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Milliseconds between polls.
    pub poll_period: u64,
    /// Topic path under which endpoint topics are created.
    pub topic_path_root: String,
}

impl ServiceConfig {
    /// A service with no endpoints.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        secure: bool,
        poll_period: u64,
        topic_path_root: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            secure,
            endpoints: Vec::new(),
            poll_period,
            topic_path_root: topic_path_root.into(),
        }
    }
}

/// One polled endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    /// Path polled on the service.
    pub url: String,
    /// Topic path, relative to the service's root.
    pub topic_path: String,
    /// Content type the endpoint produces (`json`, `string`, `binary`).
    pub produces: String,
}

/// A request against the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ModelRequest {
    ListServices,
    CreateService {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<ServiceConfig>,
    },
    DeleteService {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
    },
    CreateEndpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<EndpointConfig>,
    },
    DeleteEndpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint_name: Option<String>,
    },
}

impl ModelRequest {
    const TYPES: [&'static str; 5] = [
        "list-services",
        "create-service",
        "delete-service",
        "create-endpoint",
        "delete-endpoint",
    ];
}

// ============================================================================
// Client
// ============================================================================

/// Client for the adapter's model.
///
/// Nothing happens on construction. The first operation establishes the
/// session and opens the model channel; later operations reuse both. If the
/// session terminates, the next operation re-establishes it and opens a
/// fresh channel.
pub struct ModelClient<C: Connector> {
    establisher: Arc<SessionEstablisher<C>>,
    channel_name: String,
    options: ChannelOptions,
    channel: tokio::sync::Mutex<Option<Arc<RequestChannel>>>,
}

impl<C> ModelClient<C>
where
    C: Connector,
    C::Session: Transport,
{
    /// Create a client on the default model channel.
    pub fn new(establisher: Arc<SessionEstablisher<C>>, options: ChannelOptions) -> Self {
        Self::with_channel(establisher, DEFAULT_MODEL_CHANNEL, options)
    }

    /// Create a client on a specific channel.
    pub fn with_channel(
        establisher: Arc<SessionEstablisher<C>>,
        channel_name: impl Into<String>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            establisher,
            channel_name: channel_name.into(),
            options,
            channel: tokio::sync::Mutex::new(None),
        }
    }

    /// The establisher sessions come from, e.g. to build a
    /// [`SessionGate`](crate::gate::SessionGate) over.
    pub fn establisher(&self) -> &Arc<SessionEstablisher<C>> {
        &self.establisher
    }

    /// The open model channel, opening one if needed.
    async fn channel(&self) -> Result<Arc<RequestChannel>, ClientError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
            debug!(channel = %self.channel_name, "model channel closed, reopening");
        }

        let mut session = self.establisher.establish().await?;
        if !session.is_connected() {
            info!("session no longer connected, re-establishing");
            self.establisher.invalidate();
            session = self.establisher.establish().await?;
        }

        let channel = Arc::new(RequestChannel::open(
            session,
            self.channel_name.clone(),
            self.options,
        ));
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn send(&self, request: &ModelRequest) -> Result<Value, ClientError> {
        let channel = self.channel().await?;
        let payload = serde_json::to_value(request).map_err(RequestError::from)?;
        Ok(channel.request(payload).await?)
    }

    /// Every configured service.
    pub async fn list_services(&self) -> Result<Vec<ServiceConfig>, ClientError> {
        let channel = self.channel().await?;
        Ok(channel.call(&ModelRequest::ListServices).await?)
    }

    /// The service called `name`, if there is one.
    pub async fn get_service(&self, name: &str) -> Result<Option<ServiceConfig>, ClientError> {
        let services = self.list_services().await?;
        Ok(services.into_iter().find(|service| service.name == name))
    }

    /// Add a service.
    pub async fn create_service(&self, service: ServiceConfig) -> Result<(), ClientError> {
        self.send(&ModelRequest::CreateService {
            service: Some(service),
        })
        .await?;
        Ok(())
    }

    /// Remove the service called `name`.
    pub async fn delete_service(&self, name: &str) -> Result<(), ClientError> {
        self.send(&ModelRequest::DeleteService {
            service_name: Some(name.to_string()),
        })
        .await?;
        Ok(())
    }

    /// Add an endpoint to the service called `service_name`.
    pub async fn create_endpoint(
        &self,
        service_name: &str,
        endpoint: EndpointConfig,
    ) -> Result<(), ClientError> {
        self.send(&ModelRequest::CreateEndpoint {
            service_name: Some(service_name.to_string()),
            endpoint: Some(endpoint),
        })
        .await?;
        Ok(())
    }

    /// Remove an endpoint from the service called `service_name`.
    pub async fn delete_endpoint(
        &self,
        service_name: &str,
        endpoint_name: &str,
    ) -> Result<(), ClientError> {
        self.send(&ModelRequest::DeleteEndpoint {
            service_name: Some(service_name.to_string()),
            endpoint_name: Some(endpoint_name.to_string()),
        })
        .await?;
        Ok(())
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Serves [`ModelRequest`]s against an owned [`Model`].
#[derive(Default)]
pub struct ModelController {
    model: Mutex<Model>,
}

impl ModelController {
    /// A controller over an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller over `model`.
    pub fn with_model(model: Model) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    fn lock_model(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(|poisoned| {
            warn!("model mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// A snapshot of the current model.
    pub fn model(&self) -> Model {
        self.lock_model().clone()
    }

    /// Apply one request to the model.
    pub fn handle(&self, request: ModelRequest) -> Result<Value, String> {
        let mut model = self.lock_model();
        match request {
            ModelRequest::ListServices => {
                serde_json::to_value(&model.services).map_err(|e| e.to_string())
            }
            ModelRequest::CreateService { service } => {
                let service = service.ok_or("no service provided")?;
                info!(service = %service.name, "creating service");
                model.services.push(service);
                Ok(acknowledged())
            }
            ModelRequest::DeleteService { service_name } => {
                let name = service_name.ok_or("No service name provided")?;
                info!(service = %name, "deleting service");
                model.services.retain(|service| service.name != name);
                Ok(acknowledged())
            }
            ModelRequest::CreateEndpoint {
                service_name,
                endpoint,
            } => {
                let name = service_name.ok_or("No service name provided")?;
                let service = model.service_mut(&name).ok_or("service missing")?;
                let endpoint = endpoint.ok_or("no endpoint provided")?;
                info!(service = %name, endpoint = %endpoint.name, "creating endpoint");
                service.endpoints.push(endpoint);
                Ok(acknowledged())
            }
            ModelRequest::DeleteEndpoint {
                service_name,
                endpoint_name,
            } => {
                let name = service_name.ok_or("No service name provided")?;
                let endpoint_name = endpoint_name.ok_or("No endpoint name provided")?;
                if let Some(service) = model.service_mut(&name) {
                    info!(service = %name, endpoint = %endpoint_name, "deleting endpoint");
                    service
                        .endpoints
                        .retain(|endpoint| endpoint.name != endpoint_name);
                }
                Ok(acknowledged())
            }
        }
    }
}

fn acknowledged() -> Value {
    json!({})
}

#[async_trait]
impl Responder for ModelController {
    async fn respond(&self, payload: Value) -> Result<Value, String> {
        let kind = payload.get("type").and_then(Value::as_str);
        match kind {
            Some(kind) if ModelRequest::TYPES.contains(&kind) => {
                let request: ModelRequest = serde_json::from_value(payload.clone())
                    .map_err(|e| format!("malformed {} request: {}", kind, e))?;
                self.handle(request)
            }
            _ => {
                debug!(kind = ?kind, "ignoring unrecognised model request");
                Ok(acknowledged())
            }
        }
    }
}

impl std::fmt::Debug for ModelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelController")
            .field("services", &self.lock_model().services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::local::{serve, LocalBroker, LocalConnector};

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig::new(name, name, 80, false, 50000, name)
    }

    fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            topic_path: "a/topic".into(),
            url: "/a/url".into(),
            produces: "json".into(),
        }
    }

    #[test]
    fn test_service_wire_format() {
        let value = serde_json::to_value(service("a")).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "a",
                "host": "a",
                "port": 80,
                "secure": false,
                "endpoints": [],
                "pollPeriod": 50000,
                "topicPathRoot": "a",
            })
        );
    }

    #[test]
    fn test_request_wire_format() {
        let request = ModelRequest::DeleteService {
            service_name: Some("b".into()),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "delete-service", "serviceName": "b"})
        );
        assert_eq!(
            serde_json::to_value(&ModelRequest::ListServices).unwrap(),
            json!({"type": "list-services"})
        );
    }

    #[tokio::test]
    async fn test_create_service_without_endpoints_field() {
        let controller = ModelController::new();
        let message = json!({
            "type": "create-service",
            "service": {
                "name": "",
                "host": "",
                "port": 80,
                "secure": false,
                "pollPeriod": 50000,
                "topicPathRoot": "",
            },
        });

        assert_eq!(controller.respond(message).await, Ok(json!({})));
        assert_eq!(controller.model().services, vec![service("")]);
    }

    #[tokio::test]
    async fn test_create_two_services_and_delete_one() {
        let controller = ModelController::new();
        for name in ["a", "b"] {
            let request = ModelRequest::CreateService {
                service: Some(service(name)),
            };
            assert_eq!(controller.handle(request), Ok(json!({})));
        }

        let delete = json!({"type": "delete-service", "serviceName": "b"});
        assert_eq!(controller.respond(delete).await, Ok(json!({})));

        assert_eq!(controller.model().services, vec![service("a")]);
    }

    #[tokio::test]
    async fn test_missing_fields_are_errors() {
        let controller = ModelController::new();

        let cases = [
            (json!({"type": "create-service"}), "no service provided"),
            (json!({"type": "delete-service"}), "No service name provided"),
            (json!({"type": "delete-endpoint"}), "No service name provided"),
            (
                json!({"type": "delete-endpoint", "serviceName": "a"}),
                "No endpoint name provided",
            ),
        ];
        for (message, expected) in cases {
            assert_eq!(controller.respond(message).await, Err(expected.to_string()));
        }
    }

    #[tokio::test]
    async fn test_deleting_missing_things_is_acknowledged() {
        let controller = ModelController::new();

        let delete_service = json!({"type": "delete-service", "serviceName": "b"});
        let delete_endpoint = json!({
            "type": "delete-endpoint",
            "serviceName": "b",
            "endpointName": "e",
        });

        assert_eq!(controller.respond(delete_service).await, Ok(json!({})));
        assert_eq!(controller.respond(delete_endpoint).await, Ok(json!({})));
    }

    #[tokio::test]
    async fn test_unknown_and_untyped_requests_are_ignored() {
        let controller = ModelController::with_model(Model {
            services: vec![service("a")],
        });

        assert_eq!(controller.respond(json!({})).await, Ok(json!({})));
        assert_eq!(
            controller.respond(json!({"type": "ha, ha"})).await,
            Ok(json!({}))
        );
        assert_eq!(controller.model().services.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_known_request_is_an_error() {
        let controller = ModelController::new();
        let message = json!({"type": "create-service", "service": {"name": 7}});

        let error = controller.respond(message).await.unwrap_err();
        assert!(error.starts_with("malformed create-service request"));
    }

    #[test]
    fn test_endpoints_on_services() {
        let controller = ModelController::new();
        controller
            .handle(ModelRequest::CreateService {
                service: Some(service("a")),
            })
            .unwrap();

        let missing = controller.handle(ModelRequest::CreateEndpoint {
            service_name: Some("missing-service".into()),
            endpoint: Some(endpoint("endpoint-0")),
        });
        assert_eq!(missing, Err("service missing".to_string()));

        controller
            .handle(ModelRequest::CreateEndpoint {
                service_name: Some("a".into()),
                endpoint: Some(endpoint("endpoint-0")),
            })
            .unwrap();
        assert_eq!(
            controller.model().service("a").unwrap().endpoints,
            vec![endpoint("endpoint-0")]
        );

        controller
            .handle(ModelRequest::DeleteEndpoint {
                service_name: Some("a".into()),
                endpoint_name: Some("endpoint-0".into()),
            })
            .unwrap();
        assert!(controller.model().service("a").unwrap().endpoints.is_empty());
    }

    fn client(broker: &LocalBroker) -> ModelClient<LocalConnector> {
        let establisher = Arc::new(SessionEstablisher::new(LocalConnector::new(broker.clone())));
        ModelClient::new(establisher, ChannelOptions::default())
    }

    #[tokio::test]
    async fn test_client_round_trip_through_broker() {
        let broker = LocalBroker::new();
        let _server = serve(broker.clone(), DEFAULT_MODEL_CHANNEL, ModelController::new());
        let client = client(&broker);

        assert!(client.list_services().await.unwrap().is_empty());

        client.create_service(service("a")).await.unwrap();
        client.create_service(service("b")).await.unwrap();
        client.create_endpoint("a", endpoint("e")).await.unwrap();
        client.delete_service("b").await.unwrap();

        let services = client.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].endpoints, vec![endpoint("e")]);
        assert_eq!(client.get_service("b").await.unwrap(), None);

        client.delete_endpoint("a", "e").await.unwrap();
        let a = client.get_service("a").await.unwrap().unwrap();
        assert!(a.endpoints.is_empty());

        // One session served every call.
        assert_eq!(client.establisher().connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_client_surfaces_remote_errors() {
        let broker = LocalBroker::new();
        let _server = serve(broker.clone(), DEFAULT_MODEL_CHANNEL, ModelController::new());
        let client = client(&broker);

        let result = client.create_endpoint("missing-service", endpoint("e")).await;

        match result {
            Err(ClientError::Request(RequestError::Remote { message })) => {
                assert_eq!(message, "service missing")
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_surfaces_connect_failure() {
        let broker = LocalBroker::new();
        let client = client(&broker);
        client.establisher().connector().refuse("bad credentials");

        let result = client.list_services().await;

        assert!(matches!(
            result,
            Err(ClientError::Session(SessionError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn test_client_reconnects_after_session_loss() {
        let broker = LocalBroker::new();
        let _server = serve(broker.clone(), DEFAULT_MODEL_CHANNEL, ModelController::new());
        let client = client(&broker);

        client.create_service(service("a")).await.unwrap();
        let first = client.establisher().establish().await.unwrap();

        first.disconnect();
        // Wait for the channel listener to observe the termination.
        loop {
            let channel = client.channel.lock().await;
            if channel.as_ref().map_or(true, |c| c.is_closed()) {
                break;
            }
            drop(channel);
            tokio::task::yield_now().await;
        }

        let services = client.list_services().await.unwrap();
        assert_eq!(services, vec![service("a")]);
        assert_eq!(client.establisher().connect_attempts(), 2);
    }
}
