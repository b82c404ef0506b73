//! The session gate: may dependent calls proceed?
//!
//! Callers consult the gate before issuing requests that need a live
//! session. The gate takes one snapshot of the session provider and
//! classifies it:
//!
//! | Provider says                  | Status         | `can_proceed()` | Remediation |
//! |--------------------------------|----------------|-----------------|-------------|
//! | error (no session)             | `NoSession`    | `false`         | once        |
//! | handle, `is_connected()==false`| `Disconnected` | `false`         | once        |
//! | handle, `is_connected()==true` | `Connected`    | `true`          | never       |
//!
//! There are no retries and no polling. `can_proceed()` collapses both
//! denial causes into `false`; callers that need to know which one applied
//! can call [`SessionGate::status`], which has no side effect.

use tracing::{debug, info};

use crate::session::{SessionHandle, SessionProvider};

/// What to do when the gate denies a caller (e.g. show a login view).
pub trait Remediation: Send + Sync {
    /// Route the user towards re-establishing a session.
    fn remediate(&self);
}

impl<F> Remediation for F
where
    F: Fn() + Send + Sync,
{
    fn remediate(&self) {
        self()
    }
}

/// Classification of the provider's current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The provider had no session.
    NoSession,
    /// A session exists but is not connected.
    Disconnected,
    /// A connected session exists.
    Connected,
}

impl SessionStatus {
    /// Whether dependent calls may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

/// Allows or denies dependent calls based on session presence and
/// connectivity.
pub struct SessionGate<P, R> {
    provider: P,
    remediation: R,
}

impl<P, R> SessionGate<P, R>
where
    P: SessionProvider,
    R: Remediation,
{
    /// Create a gate over `provider` that calls `remediation` on denial.
    pub fn new(provider: P, remediation: R) -> Self {
        Self {
            provider,
            remediation,
        }
    }

    /// Classify the current session without side effects.
    pub async fn status(&self) -> SessionStatus {
        match self.provider.get_session().await {
            Err(error) => {
                debug!(error = %error, "session provider has no session");
                SessionStatus::NoSession
            }
            Ok(session) if session.is_connected() => SessionStatus::Connected,
            Ok(_) => SessionStatus::Disconnected,
        }
    }

    /// `true` if a connected session exists. Otherwise triggers remediation
    /// once and returns `false`.
    pub async fn can_proceed(&self) -> bool {
        let status = self.status().await;
        if status.is_allowed() {
            return true;
        }

        info!(status = ?status, "session gate denied, remediating");
        self.remediation.remediate();
        false
    }

    /// The provider consulted by this gate.
    pub fn provider(&self) -> &P {
        &self.provider
    }
}
