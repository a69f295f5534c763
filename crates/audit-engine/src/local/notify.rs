use async_trait::async_trait;
use audit_core::collab::{NotificationKind, Notifier};

/// Emits notifications as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_email: &str, kind: NotificationKind, payload: serde_json::Value) -> Result<(), String> {
        tracing::info!(to = user_email, ?kind, %payload, "notification");
        Ok(())
    }
}
