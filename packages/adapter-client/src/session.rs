//! Session handles, providers, and memoized session establishment.
//!
//! # Lifecycle
//!
//! A [`SessionEstablisher`] owns the one session of its [`Connector`]:
//!
//! ```text
//!                 establish()                 connect ok
//! Uninitialized ──────────────► Establishing ───────────► Established
//!       ▲                         │    ▲                       │
//!       │            connect err  │    │ establish()           │ invalidate()
//!       │                         ▼    │                       │
//!       └──────── invalidate() ─ Failed                        │
//!       └──────────────────────────────────────────────────────┘
//! ```
//!
//! While `Establishing`, the slot holds one shared pending future. Every
//! caller of [`SessionEstablisher::establish`] attaches to it, so concurrent
//! callers trigger a single connect and all observe the same `Arc` handle or
//! the same `Arc<ConnectError>`.
//!
//! A failed establishment is remembered (for [`SessionEstablisher::state`]
//! and for [`SessionProvider::get_session`]) but not cached: the next
//! `establish()` starts a fresh attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, SessionError};

/// A session whose connectivity can be queried.
pub trait SessionHandle: Send + Sync + 'static {
    /// Whether the session is currently connected.
    fn is_connected(&self) -> bool;
}

/// Supplies the current session handle.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The session type handed out.
    type Session: SessionHandle;

    /// The current session, or an error if there is none.
    async fn get_session(&self) -> Result<Arc<Self::Session>, SessionError>;
}

#[async_trait]
impl<P: SessionProvider + ?Sized> SessionProvider for Arc<P> {
    type Session = P::Session;

    async fn get_session(&self) -> Result<Arc<Self::Session>, SessionError> {
        (**self).get_session().await
    }
}

/// Opens new sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The session type produced.
    type Session: SessionHandle;

    /// Open a session.
    async fn connect(&self) -> Result<Self::Session, ConnectError>;
}

/// Observable state of a [`SessionEstablisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishmentState {
    /// No attempt has been made, or the session was invalidated.
    Uninitialized,
    /// A connect is in flight.
    Establishing,
    /// A session is available.
    Established,
    /// The last connect failed.
    Failed,
}

type PendingConnect<S> = Shared<BoxFuture<'static, Result<Arc<S>, Arc<ConnectError>>>>;

enum Slot<S> {
    Uninitialized,
    Establishing {
        generation: u64,
        pending: PendingConnect<S>,
    },
    Established(Arc<S>),
    Failed(Arc<ConnectError>),
}

/// Memoizes session establishment for one connector.
pub struct SessionEstablisher<C: Connector> {
    connector: Arc<C>,
    slot: Mutex<Slot<C::Session>>,
    attempts: AtomicU64,
}

impl<C: Connector> SessionEstablisher<C> {
    /// Create an establisher that has not connected yet.
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            slot: Mutex::new(Slot::Uninitialized),
            attempts: AtomicU64::new(0),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot<C::Session>> {
        self.slot.lock().unwrap_or_else(|poisoned| {
            warn!("session slot mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Return the established session, connecting first if needed.
    ///
    /// Exactly one connect runs at a time. Callers arriving while it runs
    /// share its result.
    pub async fn establish(&self) -> Result<Arc<C::Session>, SessionError> {
        let (generation, pending) = {
            let mut slot = self.lock_slot();
            match &*slot {
                Slot::Established(session) => return Ok(session.clone()),
                Slot::Establishing {
                    generation,
                    pending,
                } => {
                    debug!(generation, "joining in-flight session establishment");
                    (*generation, pending.clone())
                }
                Slot::Uninitialized | Slot::Failed(_) => {
                    let generation = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(generation, "establishing session");

                    let connector = self.connector.clone();
                    let pending = async move {
                        connector.connect().await.map(Arc::new).map_err(Arc::new)
                    }
                    .boxed()
                    .shared();

                    *slot = Slot::Establishing {
                        generation,
                        pending: pending.clone(),
                    };
                    (generation, pending)
                }
            }
        };

        let result = pending.await;
        self.settle(generation, &result);
        result.map_err(SessionError::Connect)
    }

    /// Move the slot out of `Establishing` if it still belongs to `generation`.
    fn settle(&self, generation: u64, result: &Result<Arc<C::Session>, Arc<ConnectError>>) {
        let mut slot = self.lock_slot();
        let current = matches!(
            &*slot,
            Slot::Establishing { generation: g, .. } if *g == generation
        );
        if !current {
            return;
        }

        *slot = match result {
            Ok(session) => {
                info!(generation, "session established");
                Slot::Established(session.clone())
            }
            Err(error) => {
                warn!(generation, error = %error, "session establishment failed");
                Slot::Failed(error.clone())
            }
        };
    }

    /// Forget the current session so the next [`establish`](Self::establish)
    /// reconnects.
    ///
    /// An in-flight establishment is left to finish; its result is then
    /// discarded by the slot but still delivered to its waiters.
    pub fn invalidate(&self) {
        let mut slot = self.lock_slot();
        if !matches!(&*slot, Slot::Uninitialized) {
            info!("invalidating session");
        }
        *slot = Slot::Uninitialized;
    }

    /// The current lifecycle state.
    pub fn state(&self) -> EstablishmentState {
        match &*self.lock_slot() {
            Slot::Uninitialized => EstablishmentState::Uninitialized,
            Slot::Establishing { .. } => EstablishmentState::Establishing,
            Slot::Established(_) => EstablishmentState::Established,
            Slot::Failed(_) => EstablishmentState::Failed,
        }
    }

    /// How many connects have been started.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The connector sessions are opened with.
    pub fn connector(&self) -> &C {
        &self.connector
    }
}

#[async_trait]
impl<C: Connector> SessionProvider for SessionEstablisher<C> {
    type Session = C::Session;

    /// The established session. Waits for an in-flight establishment but
    /// never starts one.
    async fn get_session(&self) -> Result<Arc<C::Session>, SessionError> {
        let (generation, pending) = match &*self.lock_slot() {
            Slot::Established(session) => return Ok(session.clone()),
            Slot::Establishing {
                generation,
                pending,
            } => (*generation, pending.clone()),
            Slot::Uninitialized | Slot::Failed(_) => return Err(SessionError::NoSession),
        };

        let result = pending.await;
        self.settle(generation, &result);
        result.map_err(SessionError::Connect)
    }
}

impl<C: Connector> std::fmt::Debug for SessionEstablisher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEstablisher")
            .field("state", &self.state())
            .field("connect_attempts", &self.connect_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingConnector, StaticSession};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_establish_connects_once() {
        let establisher = Arc::new(SessionEstablisher::new(
            CountingConnector::connected().with_delay(Duration::from_millis(20)),
        ));

        let a = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.establish().await }
        });
        let b = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.establish().await }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(establisher.connector().connects(), 1);
        assert_eq!(establisher.connect_attempts(), 1);
        assert_eq!(establisher.state(), EstablishmentState::Established);
    }

    #[tokio::test]
    async fn test_concurrent_establish_shares_failure() {
        let establisher = SessionEstablisher::new(
            CountingConnector::refusing("bad credentials").with_delay(Duration::from_millis(20)),
        );

        let (a, b) = tokio::join!(establisher.establish(), establisher.establish());

        let (a, b) = match (a, b) {
            (Err(SessionError::Connect(a)), Err(SessionError::Connect(b))) => (a, b),
            other => panic!("expected two connect failures, got {:?}", other),
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(establisher.connector().connects(), 1);
        assert_eq!(establisher.state(), EstablishmentState::Failed);
    }

    #[tokio::test]
    async fn test_established_session_is_reused() {
        let establisher = SessionEstablisher::new(CountingConnector::connected());

        let first = establisher.establish().await.unwrap();
        let second = establisher.establish().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(establisher.connector().connects(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let establisher = SessionEstablisher::new(CountingConnector::refusing("down"));

        assert!(establisher.establish().await.is_err());
        assert!(establisher.establish().await.is_err());

        assert_eq!(establisher.connector().connects(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reconnect() {
        let establisher = SessionEstablisher::new(CountingConnector::connected());

        let first = establisher.establish().await.unwrap();
        establisher.invalidate();
        assert_eq!(establisher.state(), EstablishmentState::Uninitialized);

        let second = establisher.establish().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(establisher.connector().connects(), 2);
    }

    #[tokio::test]
    async fn test_get_session_without_establishment_is_no_session() {
        let establisher = SessionEstablisher::new(CountingConnector::connected());

        let result = establisher.get_session().await;

        assert!(matches!(result, Err(SessionError::NoSession)));
        assert_eq!(establisher.connector().connects(), 0);
    }

    #[tokio::test]
    async fn test_get_session_after_failure_is_no_session() {
        let establisher = SessionEstablisher::new(CountingConnector::refusing("down"));
        let _ = establisher.establish().await;

        assert!(matches!(
            establisher.get_session().await,
            Err(SessionError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_get_session_waits_for_in_flight_establishment() {
        let establisher = Arc::new(SessionEstablisher::new(
            CountingConnector::connected().with_delay(Duration::from_millis(20)),
        ));

        let establishing = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.establish().await }
        });
        // Let the spawned task start the connect.
        while establisher.state() != EstablishmentState::Establishing {
            tokio::task::yield_now().await;
        }

        let from_provider = establisher.get_session().await.unwrap();
        let from_establish = establishing.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&from_provider, &from_establish));
        assert_eq!(establisher.connector().connects(), 1);
    }

    #[tokio::test]
    async fn test_get_session_keeps_in_flight_result_after_invalidate() {
        let establisher = Arc::new(SessionEstablisher::new(
            CountingConnector::refusing("down").with_delay(Duration::from_millis(20)),
        ));

        let establishing = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.establish().await }
        });
        while establisher.state() != EstablishmentState::Establishing {
            tokio::task::yield_now().await;
        }

        let mut lookup = establisher.get_session();
        assert!(futures::poll!(&mut lookup).is_pending());
        establisher.invalidate();

        assert!(matches!(lookup.await, Err(SessionError::Connect(_))));
        assert!(establishing.await.unwrap().is_err());
        assert_eq!(establisher.connect_attempts(), 1);
        assert_eq!(establisher.state(), EstablishmentState::Uninitialized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lookups_racing_failed_establishment_never_connect() {
        let establisher = Arc::new(SessionEstablisher::new(
            CountingConnector::refusing("down").with_delay(Duration::from_millis(5)),
        ));

        let establishing = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.establish().await }
        });
        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let establisher = establisher.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let _ = establisher.get_session().await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        assert!(establishing.await.unwrap().is_err());
        for lookup in lookups {
            lookup.await.unwrap();
        }

        assert_eq!(establisher.connect_attempts(), 1);
        assert_eq!(establisher.connector().connects(), 1);
        assert_eq!(establisher.state(), EstablishmentState::Failed);
    }

    #[test]
    fn test_static_session_reports_connectivity() {
        assert!(StaticSession::connected().is_connected());
        assert!(!StaticSession::disconnected().is_connected());
    }
}
