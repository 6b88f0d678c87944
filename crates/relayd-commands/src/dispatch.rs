//! Command dispatch with a shared-session path and a one-shot fallback.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use relayd_core::CommandEnvelope;
use relayd_mqtt::{OneShotClient, RealtimeProxy};

use crate::error::{CommandError, Result};

/// Something that can deliver a command to a device.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    async fn publish_command(&self, envelope: &CommandEnvelope) -> relayd_mqtt::Result<()>;
}

#[async_trait]
impl CommandPublisher for RealtimeProxy {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn publish_command(&self, envelope: &CommandEnvelope) -> relayd_mqtt::Result<()> {
        RealtimeProxy::publish_command(self, envelope).await
    }
}

#[async_trait]
impl CommandPublisher for OneShotClient {
    fn name(&self) -> &'static str {
        "one-shot"
    }

    async fn publish_command(&self, envelope: &CommandEnvelope) -> relayd_mqtt::Result<()> {
        OneShotClient::publish_command(self, envelope).await
    }
}

/// Routes commands to the shared session, falling back to a fresh
/// connection only when the shared session could not be reached.
///
/// Publish timeouts and per-target failures from the shared session are
/// returned as is.
#[derive(Clone, Default)]
pub struct CommandDispatcher {
    shared: Option<Arc<dyn CommandPublisher>>,
    fallback: Option<Arc<dyn CommandPublisher>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared(mut self, publisher: Arc<dyn CommandPublisher>) -> Self {
        self.shared = Some(publisher);
        self
    }

    pub fn with_fallback(mut self, publisher: Arc<dyn CommandPublisher>) -> Self {
        self.fallback = Some(publisher);
        self
    }

    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<()> {
        if let Some(shared) = &self.shared {
            match shared.publish_command(envelope).await {
                Ok(()) => {
                    debug!(
                        request_id = envelope.request_id(),
                        path = shared.name(),
                        "Command published"
                    );
                    return Ok(());
                }
                Err(e) if e.is_unavailable() && self.fallback.is_some() => {
                    info!(
                        request_id = envelope.request_id(),
                        path = shared.name(),
                        error = %e,
                        "Shared session unavailable, falling back"
                    );
                }
                Err(e) => {
                    warn!(
                        request_id = envelope.request_id(),
                        path = shared.name(),
                        error = %e,
                        "Command publish failed"
                    );
                    return Err(e.into());
                }
            }
        }

        let fallback = self.fallback.as_ref().ok_or(CommandError::NoPublisher)?;
        fallback.publish_command(envelope).await?;
        debug!(
            request_id = envelope.request_id(),
            path = fallback.name(),
            "Command published"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPublisher;
    use super::*;
    use relayd_core::CommandAction;
    use relayd_mqtt::MqttError;

    fn envelope() -> CommandEnvelope {
        CommandEnvelope::new("plug", CommandAction::On, "req-1")
    }

    #[tokio::test]
    async fn test_shared_success_skips_fallback() {
        let shared = ScriptedPublisher::ok("shared");
        let fallback = ScriptedPublisher::ok("fallback");
        let dispatcher = CommandDispatcher::new()
            .with_shared(shared.clone())
            .with_fallback(fallback.clone());

        dispatcher.dispatch(&envelope()).await.unwrap();
        assert_eq!(shared.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_shared_falls_back() {
        let shared = ScriptedPublisher::unavailable("shared");
        let fallback = ScriptedPublisher::ok("fallback");
        let dispatcher = CommandDispatcher::new()
            .with_shared(shared.clone())
            .with_fallback(fallback.clone());

        dispatcher.dispatch(&envelope()).await.unwrap();
        assert_eq!(fallback.calls(), 1);
        assert_eq!(fallback.seen.lock()[0].request_id(), "req-1");
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried_elsewhere() {
        let shared = ScriptedPublisher::new("shared", || {
            Err(MqttError::PublishTimeout {
                topic: "cmnd/plug/POWER".into(),
            })
        });
        let fallback = ScriptedPublisher::ok("fallback");
        let dispatcher = CommandDispatcher::new()
            .with_shared(shared)
            .with_fallback(fallback.clone());

        let err = dispatcher.dispatch(&envelope()).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Publish(MqttError::PublishTimeout { .. })
        ));
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_without_fallback_surfaces() {
        let dispatcher =
            CommandDispatcher::new().with_shared(ScriptedPublisher::unavailable("shared"));
        let err = dispatcher.dispatch(&envelope()).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Publish(MqttError::ConnectionUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fallback_only_and_no_publisher() {
        let fallback = ScriptedPublisher::ok("fallback");
        let dispatcher = CommandDispatcher::new().with_fallback(fallback.clone());
        dispatcher.dispatch(&envelope()).await.unwrap();
        assert_eq!(fallback.calls(), 1);

        let err = CommandDispatcher::new().dispatch(&envelope()).await.unwrap_err();
        assert!(matches!(err, CommandError::NoPublisher));
    }
}
