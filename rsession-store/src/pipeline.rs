//! Ordered command pipeline in front of an async store connection.
//!
//! A [`HashBackend`] is a single connection that can only run one command at
//! a time. [`CommandPipeline`] owns it on a dedicated worker task and feeds
//! it commands over a channel, so commands run in exactly the order they were
//! issued even though every caller gets its own acknowledgement future.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{self, FutureExt};
use rsession_core::{StoreError, StoreResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::store::{FieldMap, HashStore, StoreFuture};

/// A connection to the remote store.
#[async_trait]
pub trait HashBackend: Send + 'static {
    async fn get_all_fields(&mut self, key: &str) -> StoreResult<FieldMap>;

    async fn set_fields(&mut self, key: &str, fields: FieldMap) -> StoreResult<()>;

    async fn remove_field(&mut self, key: &str, field: &str) -> StoreResult<()>;

    async fn remove_key(&mut self, key: &str) -> StoreResult<()>;

    async fn expire_key(&mut self, key: &str, ttl: Duration) -> StoreResult<()>;
}

type Reply<T> = oneshot::Sender<StoreResult<T>>;

enum Command {
    GetAll {
        key: String,
        reply: Reply<FieldMap>,
    },
    Set {
        key: String,
        fields: FieldMap,
        reply: Reply<()>,
    },
    RemoveField {
        key: String,
        field: String,
        reply: Reply<()>,
    },
    RemoveKey {
        key: String,
        reply: Reply<()>,
    },
    Expire {
        key: String,
        ttl: Duration,
        reply: Reply<()>,
    },
    Shutdown,
}

/// [`HashStore`] that serializes commands onto one backend connection.
pub struct CommandPipeline {
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandPipeline {
    /// Start a worker that owns `backend`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<B: HashBackend>(backend: B) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(backend, rx));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn submit<T: Send + 'static>(
        &self,
        command: Command,
        ack: oneshot::Receiver<StoreResult<T>>,
    ) -> StoreFuture<T> {
        if self.tx.send(command).is_err() {
            return future::ready(Err(StoreError::Disconnected)).boxed();
        }
        async move { ack.await.unwrap_or(Err(StoreError::Disconnected)) }.boxed()
    }

    /// Stop the worker after every command issued so far has run.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "pipeline worker ended abnormally");
            }
        }
    }
}

impl HashStore for CommandPipeline {
    fn get_all_fields(&self, key: &str) -> StoreFuture<FieldMap> {
        let (reply, ack) = oneshot::channel();
        let key = key.to_string();
        self.submit(Command::GetAll { key, reply }, ack)
    }

    fn set_fields(&self, key: &str, fields: FieldMap) -> StoreFuture<()> {
        let (reply, ack) = oneshot::channel();
        let key = key.to_string();
        self.submit(Command::Set { key, fields, reply }, ack)
    }

    fn remove_field(&self, key: &str, field: &str) -> StoreFuture<()> {
        let (reply, ack) = oneshot::channel();
        let key = key.to_string();
        let field = field.to_string();
        self.submit(Command::RemoveField { key, field, reply }, ack)
    }

    fn remove_key(&self, key: &str) -> StoreFuture<()> {
        let (reply, ack) = oneshot::channel();
        let key = key.to_string();
        self.submit(Command::RemoveKey { key, reply }, ack)
    }

    fn expire_key(&self, key: &str, ttl: Duration) -> StoreFuture<()> {
        let (reply, ack) = oneshot::channel();
        let key = key.to_string();
        self.submit(Command::Expire { key, ttl, reply }, ack)
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

async fn run_worker<B: HashBackend>(mut backend: B, mut rx: mpsc::UnboundedReceiver<Command>) {
    // A dropped acknowledgement future means nobody is waiting; the command
    // still runs, so send errors are ignored.
    while let Some(command) = rx.recv().await {
        match command {
            Command::GetAll { key, reply } => {
                let _ = reply.send(backend.get_all_fields(&key).await);
            }
            Command::Set { key, fields, reply } => {
                let _ = reply.send(backend.set_fields(&key, fields).await);
            }
            Command::RemoveField { key, field, reply } => {
                let _ = reply.send(backend.remove_field(&key, &field).await);
            }
            Command::RemoveKey { key, reply } => {
                let _ = reply.send(backend.remove_key(&key).await);
            }
            Command::Expire { key, ttl, reply } => {
                let _ = reply.send(backend.expire_key(&key, ttl).await);
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!("store pipeline worker stopped");
}
