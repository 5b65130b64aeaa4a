//! Store connection management.
//!
//! One client is shared by every record in the process. The manager connects
//! on first use and replaces the client when it reports itself disconnected.

use std::sync::Arc;

use async_trait::async_trait;
use rsession_core::{SessionConfig, StoreResult};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::HashStore;

/// Opens a client for the configured endpoint.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> StoreResult<Arc<dyn HashStore>>;
}

/// Adapts a plain function into a [`StoreConnector`].
pub struct FnConnector<F>(pub F);

#[async_trait]
impl<F> StoreConnector for FnConnector<F>
where
    F: Fn(&SessionConfig) -> StoreResult<Arc<dyn HashStore>> + Send + Sync,
{
    async fn connect(&self, config: &SessionConfig) -> StoreResult<Arc<dyn HashStore>> {
        (self.0)(config)
    }
}

/// Owns the shared store client.
pub struct ConnectionManager {
    connector: Arc<dyn StoreConnector>,
    config: SessionConfig,
    current: Mutex<Option<Arc<dyn HashStore>>>,
}

impl ConnectionManager {
    pub fn new(config: SessionConfig, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            config,
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The current client, connecting first if there is none or the
    /// previous one has disconnected.
    ///
    /// Concurrent callers share a single connection attempt.
    pub async fn store(&self) -> StoreResult<Arc<dyn HashStore>> {
        let mut current = self.current.lock().await;
        if let Some(store) = current.as_ref() {
            if store.is_connected() {
                return Ok(Arc::clone(store));
            }
            warn!(endpoint = %self.config.endpoint(), "store client disconnected, reconnecting");
        }

        let store = self.connector.connect(&self.config).await?;
        debug!(endpoint = %self.config.endpoint(), "connected to session store");
        *current = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Drop the current client. The next [`store`](Self::store) reconnects.
    pub async fn reset(&self) {
        self.current.lock().await.take();
    }

    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|store| store.is_connected())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.endpoint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryHashStore;
    use crate::pipeline::CommandPipeline;
    use rsession_core::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_connector(attempts: Arc<AtomicUsize>) -> Arc<dyn StoreConnector> {
        Arc::new(FnConnector(move |_: &SessionConfig| {
            attempts.fetch_add(1, Ordering::SeqCst);
            let store: Arc<dyn HashStore> =
                Arc::new(CommandPipeline::spawn(InMemoryHashStore::shared()));
            Ok(store)
        }))
    }

    #[tokio::test]
    async fn test_store_is_reused_while_connected() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = counting_connector(Arc::clone(&attempts));
        let manager = ConnectionManager::new(SessionConfig::new(), connector);

        let first = manager.store().await.unwrap();
        let second = manager.store().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_reset_forces_reconnect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = counting_connector(Arc::clone(&attempts));
        let manager = ConnectionManager::new(SessionConfig::new(), connector);

        manager.store().await.unwrap();
        manager.reset().await;
        assert!(!manager.is_connected().await);
        manager.store().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnected_client_is_replaced() {
        let pipeline = Arc::new(CommandPipeline::spawn(InMemoryHashStore::shared()));
        let handed_out = Arc::clone(&pipeline);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let connector = FnConnector(move |_: &SessionConfig| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let store: Arc<dyn HashStore> = if n == 0 {
                Arc::clone(&handed_out) as Arc<dyn HashStore>
            } else {
                Arc::new(InMemoryHashStore::new())
            };
            Ok(store)
        });
        let manager = ConnectionManager::new(SessionConfig::new(), Arc::new(connector));

        manager.store().await.unwrap();
        pipeline.shutdown().await;
        let replacement = manager.store().await.unwrap();
        assert!(replacement.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let connector = FnConnector(|config: &SessionConfig| -> StoreResult<Arc<dyn HashStore>> {
            Err(StoreError::ConnectionFailed {
                endpoint: config.endpoint(),
                reason: "refused".to_string(),
            })
        });
        let manager = ConnectionManager::new(SessionConfig::new(), Arc::new(connector));
        let Err(err) = manager.store().await else {
            panic!("connect should fail");
        };
        assert!(matches!(err, StoreError::ConnectionFailed { .. }));
        assert!(!manager.is_connected().await);
    }
}
