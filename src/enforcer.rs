//! src/enforcer.rs
//! Kary po stronie platformy, wstrzykiwane do orkiestratora. Silnik sam nie gada
//! z platformą; każdy kick/mute/delete idzie przez ten trait.

use async_trait::async_trait;
use serde::Serialize;

use crate::decision::{Reason, Severity};
use crate::error::EnforcementError;
use crate::event::ContentRef;
use crate::window::Millis;

/// Co dostają admini, gdy scope wchodzi w lockdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyPayload {
    pub reason: Reason,
    pub severity: Severity,
    pub message: String,
    pub lockdown_until: Option<Millis>,
    pub triggered_by: String,
}

#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn kick(&self, scope_id: &str, identity_id: &str, reason: &str)
    -> Result<(), EnforcementError>;

    async fn mute(
        &self,
        scope_id: &str,
        identity_id: &str,
        duration_ms: u64,
        reason: &str,
    ) -> Result<(), EnforcementError>;

    async fn delete_content(&self, content: &ContentRef) -> Result<(), EnforcementError>;

    async fn notify(&self, scope_id: &str, payload: &NotifyPayload)
    -> Result<(), EnforcementError>;
}

/// Loguje akcje zamiast je wykonywać. Używany przez binarkę replay i jako
/// dry-run, zanim podepniemy adapter platformy.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEnforcer;

#[async_trait]
impl Enforcer for TracingEnforcer {
    async fn kick(
        &self,
        scope_id: &str,
        identity_id: &str,
        reason: &str,
    ) -> Result<(), EnforcementError> {
        tracing::info!(scope = %scope_id, identity = %identity_id, %reason, "enforce: kick");
        Ok(())
    }

    async fn mute(
        &self,
        scope_id: &str,
        identity_id: &str,
        duration_ms: u64,
        reason: &str,
    ) -> Result<(), EnforcementError> {
        tracing::info!(
            scope = %scope_id,
            identity = %identity_id,
            duration_ms,
            %reason,
            "enforce: mute"
        );
        Ok(())
    }

    async fn delete_content(&self, content: &ContentRef) -> Result<(), EnforcementError> {
        tracing::info!(
            scope = %content.scope_id,
            identity = %content.identity_id,
            event_id = ?content.event_id,
            "enforce: delete content"
        );
        Ok(())
    }

    async fn notify(&self, scope_id: &str, payload: &NotifyPayload) -> Result<(), EnforcementError> {
        tracing::warn!(
            scope = %scope_id,
            reason = %payload.reason,
            until = ?payload.lockdown_until,
            "enforce: notify admins: {}",
            payload.message
        );
        Ok(())
    }
}
