//! Cross-process schema change notifications
//!
//! Every schema mutation publishes `{"senderId": <id>}` on the configured
//! channel through `pg_notify`. A background listener forwards notifications
//! sent by *other* adapter instances to local subscribers, which reload their
//! cached schemas.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AdapterConfig;
use crate::error::Result;

/// Capacity of the subscriber channel; lagging receivers drop old events
pub const SCHEMA_CHANGE_BUFFER_SIZE: usize = 64;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Payload carried by a schema change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    #[serde(rename = "senderId")]
    pub sender_id: String,
}

/// Publishes schema changes and relays those of other instances
pub struct SchemaNotifier {
    pool: PgPool,
    channel: String,
    enabled: bool,
    sender_id: String,
    sender: broadcast::Sender<SchemaChange>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SchemaNotifier {
    pub fn new(pool: PgPool, config: &AdapterConfig) -> Self {
        let (sender, _) = broadcast::channel(SCHEMA_CHANGE_BUFFER_SIZE);
        Self {
            pool,
            channel: config.notification_channel.clone(),
            enabled: config.enable_schema_hooks,
            sender_id: uuid::Uuid::new_v4().to_string(),
            sender,
            listener: Mutex::new(None),
        }
    }

    /// Identifier stamped on notifications from this instance
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Receive schema changes made by other instances
    pub fn subscribe(&self) -> broadcast::Receiver<SchemaChange> {
        self.sender.subscribe()
    }

    /// Publish a schema change; a no-op when hooks are disabled
    pub async fn notify(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let payload = serde_json::to_string(&SchemaChange {
            sender_id: self.sender_id.clone(),
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        debug!(channel = %self.channel, "Published schema change");
        Ok(())
    }

    /// Publish a schema change after it has been committed; failures are
    /// logged because the change itself already succeeded
    pub async fn publish(&self) {
        if let Err(e) = self.notify().await {
            warn!(channel = %self.channel, error = %e, "Failed to publish schema change");
        }
    }

    /// Start relaying notifications; idempotent, and a no-op when hooks are disabled
    pub async fn start(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut guard = self.listener.lock().await;
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        let own_id = self.sender_id.clone();
        let sender = self.sender.clone();
        let channel = self.channel.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<SchemaChange>(notification.payload()) {
                            Ok(change) if change.sender_id == own_id => {}
                            Ok(change) => {
                                debug!(sender_id = %change.sender_id, "Received schema change");
                                let _ = sender.send(change);
                            }
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "Ignoring malformed schema notification")
                            }
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Schema listener connection failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }));
        debug!(channel = %self.channel, "Listening for schema changes");
        Ok(())
    }

    /// Stop the listener task
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }
}
