//! rsession Store - Write-back session records over a remote hash store
//!
//! - [`store`]: the client contract every backend implements
//! - [`record`]: the per-request record cache with dirty tracking
//! - [`coordinator`]: bookkeeping and the bounded wait for issued writes
//! - [`pipeline`]: ordered command execution over one async connection
//! - [`connection`]: shared client ownership and reconnects
//! - [`host`]: request begin/end glue
//! - [`memory`]: in-process store for tests and single-node use

pub mod connection;
pub mod coordinator;
pub mod host;
pub mod memory;
pub mod pipeline;
pub mod record;
pub mod store;

pub use connection::{ConnectionManager, FnConnector, StoreConnector};
pub use coordinator::{await_all, PendingOperation, PendingOperations, TeardownReport};
pub use host::{RequestSession, SessionEvents, SessionHost};
pub use memory::{InMemoryHashStore, LoggedOperation};
pub use pipeline::{CommandPipeline, HashBackend};
pub use record::SessionRecord;
pub use rsession_core::record_key;
pub use store::{FieldMap, HashStore, OperationKind, StoreFuture};
