//! Audited manual commands.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use relayd_core::{CommandAction, CommandEnvelope};
use relayd_storage::{CommandLogEntry, CommandResult, RelaydStore};

use crate::dispatch::CommandDispatcher;
use crate::error::{CommandError, Result};

/// Resolves the device's channel, publishes, and records the outcome.
#[derive(Clone)]
pub struct CommandService {
    dispatcher: CommandDispatcher,
    store: Arc<dyn RelaydStore>,
}

impl CommandService {
    pub fn new(dispatcher: CommandDispatcher, store: Arc<dyn RelaydStore>) -> Self {
        Self { dispatcher, store }
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Send `action` to `device_id` on its registered channel.
    ///
    /// A missing `request_id` gets a fresh `cmd-<uuid>`. The audit entry is
    /// `PUBLISHED` or `FAILED`; a failed audit write after a successful
    /// publish is only logged.
    pub async fn send(
        &self,
        device_id: &str,
        action: CommandAction,
        request_id: Option<String>,
    ) -> Result<CommandEnvelope> {
        self.send_on_channel(device_id, action, request_id, None).await
    }

    /// Like [`send`](Self::send), with an explicit channel overriding the
    /// device directory.
    pub async fn send_on_channel(
        &self,
        device_id: &str,
        action: CommandAction,
        request_id: Option<String>,
        channel: Option<&str>,
    ) -> Result<CommandEnvelope> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(CommandError::Validation("device id is required".into()));
        }
        let request_id = request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("cmd-{}", Uuid::new_v4()));
        let channel = match channel.map(str::trim).filter(|c| !c.is_empty()) {
            Some(channel) => channel.to_string(),
            None => self.store.command_channel(device_id).await?,
        };
        let envelope = CommandEnvelope::new(device_id, action, request_id).with_channel(channel);

        let outcome = self.dispatcher.dispatch(&envelope).await;
        let entry = CommandLogEntry::new(
            envelope.request_id(),
            envelope.device_id(),
            action,
            if outcome.is_ok() {
                CommandResult::Published
            } else {
                CommandResult::Failed
            },
            Utc::now(),
        );

        match outcome {
            Ok(()) => {
                info!(
                    request_id = envelope.request_id(),
                    device_id = envelope.device_id(),
                    action = %action,
                    "Command published"
                );
                if let Err(e) = self.store.record_command(entry).await {
                    warn!(request_id = envelope.request_id(), error = %e, "Audit write failed");
                }
                Ok(envelope)
            }
            Err(e) => {
                let entry = entry.with_error(e.to_string());
                if let Err(audit) = self.store.record_command(entry).await {
                    warn!(request_id = envelope.request_id(), error = %audit, "Audit write failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::ScriptedPublisher;
    use relayd_mqtt::MqttError;
    use relayd_storage::{AuditLog, DeviceDirectory, DeviceRecord, MemoryStore};

    #[tokio::test]
    async fn test_send_resolves_channel_and_audits() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_device(DeviceRecord::new("strip", "POWER2"))
            .await
            .unwrap();
        let publisher = ScriptedPublisher::ok("shared");
        let service = CommandService::new(
            CommandDispatcher::new().with_shared(publisher.clone()),
            store.clone(),
        );

        let envelope = service
            .send(" strip ", CommandAction::Off, Some("req-5".into()))
            .await
            .unwrap();
        assert_eq!(envelope.device_id(), "strip");
        assert_eq!(envelope.command_channel(), Some("POWER2"));
        assert_eq!(publisher.seen.lock()[0], envelope);

        let audit = store.recent_commands(Some("strip"), 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].request_id, "req-5");
        assert_eq!(audit[0].result, CommandResult::Published);
    }

    #[tokio::test]
    async fn test_failed_send_is_audited_with_error() {
        let store = Arc::new(MemoryStore::new());
        let publisher = ScriptedPublisher::new("shared", || {
            Err(MqttError::AllTargetsFailed {
                details: "cmnd/plug/POWER: nope".into(),
            })
        });
        let service = CommandService::new(
            CommandDispatcher::new().with_shared(publisher),
            store.clone(),
        );

        let err = service
            .send("plug", CommandAction::On, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Publish(_)));

        let audit = store.recent_commands(None, 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].request_id.starts_with("cmd-"));
        assert_eq!(audit[0].result, CommandResult::Failed);
        assert!(audit[0]
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("cmnd/plug/POWER")));
    }

    #[tokio::test]
    async fn test_explicit_channel_overrides_directory() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_device(DeviceRecord::new("strip", "POWER2"))
            .await
            .unwrap();
        let publisher = ScriptedPublisher::ok("shared");
        let service = CommandService::new(
            CommandDispatcher::new().with_shared(publisher.clone()),
            store,
        );

        let envelope = service
            .send_on_channel("strip", CommandAction::On, None, Some("POWER4"))
            .await
            .unwrap();
        assert_eq!(envelope.command_channel(), Some("POWER4"));
        assert_eq!(publisher.calls(), 1);
    }

    #[tokio::test]
    async fn test_blank_device_rejected() {
        let service = CommandService::new(CommandDispatcher::new(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            service.send("  ", CommandAction::On, None).await,
            Err(CommandError::Validation(_))
        ));
    }
}
