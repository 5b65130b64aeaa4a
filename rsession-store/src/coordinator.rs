//! Write coordination: in-flight operation bookkeeping and the bounded
//! end-of-request wait.
//!
//! Operations are fire-and-forget. The wait observes completion or gives up
//! at the deadline; it never retries, cancels, or rolls back anything that
//! was already issued.

use std::fmt;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use rsession_core::{SessionError, SessionResult, StoreError};

use crate::store::{OperationKind, StoreFuture};

/// One issued mutation and its acknowledgement.
pub struct PendingOperation {
    kind: OperationKind,
    ack: StoreFuture<()>,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, ack: StoreFuture<()>) -> Self {
        Self { kind, ack }
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Wait for the acknowledgement.
    pub async fn wait(self) -> (OperationKind, Result<(), StoreError>) {
        let result = self.ack.await;
        (self.kind, result)
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Append-only list of operations issued during one request.
#[derive(Debug, Default)]
pub struct PendingOperations {
    ops: Mutex<Vec<PendingOperation>>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, op: PendingOperation) {
        self.lock().push(op);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Kinds of every operation currently held, in issue order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        self.lock().iter().map(|op| op.kind.clone()).collect()
    }

    /// Hand off everything accumulated so far.
    pub fn take_all(&self) -> Vec<PendingOperation> {
        mem::take(&mut *self.lock())
    }
}

/// Outcome of waiting for a batch of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Operations waited on.
    pub total: usize,
    /// Operations acknowledged successfully.
    pub completed: usize,
    /// Operations the store rejected.
    pub failed: Vec<(OperationKind, StoreError)>,
    /// Operations still unacknowledged at the deadline.
    pub outstanding: usize,
}

impl TeardownReport {
    /// True when every operation was acknowledged before the deadline.
    pub fn all_completed(&self) -> bool {
        self.failed.is_empty() && self.outstanding == 0
    }

    pub fn timed_out(&self) -> bool {
        self.outstanding > 0
    }

    /// Convert into a result. A timeout takes precedence over failures.
    pub fn into_result(self) -> SessionResult<()> {
        if self.outstanding > 0 {
            return Err(SessionError::TeardownTimeout {
                outstanding: self.outstanding,
                total: self.total,
            });
        }
        match self.failed.into_iter().next() {
            Some((_, first)) => Err(SessionError::RemoteOperationFailed {
                failed: self.total - self.completed,
                total: self.total,
                first,
            }),
            None => Ok(()),
        }
    }
}

/// Wait for `ops` until all are acknowledged or `timeout` elapses.
///
/// Unacknowledged operations are dropped at the deadline, which does not
/// cancel them on the store side.
pub async fn await_all(ops: Vec<PendingOperation>, timeout: Duration) -> TeardownReport {
    let mut report = TeardownReport {
        total: ops.len(),
        ..TeardownReport::default()
    };
    if ops.is_empty() {
        return report;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut inflight: FuturesUnordered<_> =
        ops.into_iter().map(PendingOperation::wait).collect();

    loop {
        match tokio::time::timeout_at(deadline, inflight.next()).await {
            Ok(Some((_, Ok(())))) => report.completed += 1,
            Ok(Some((kind, Err(e)))) => {
                tracing::warn!(operation = %kind, error = %e, "remote operation failed");
                report.failed.push((kind, e));
            }
            Ok(None) => break,
            Err(_) => {
                report.outstanding = inflight.len();
                tracing::warn!(
                    outstanding = report.outstanding,
                    total = report.total,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for session writes"
                );
                break;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{self, FutureExt};

    fn ok_op(kind: OperationKind) -> PendingOperation {
        PendingOperation::new(kind, future::ready(Ok(())).boxed())
    }

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let report = await_all(Vec::new(), Duration::from_millis(10)).await;
        assert!(report.all_completed());
        assert_eq!(report.total, 0);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_all_ok() {
        let ops = vec![
            ok_op(OperationKind::RemoveKey),
            ok_op(OperationKind::ExpireKey { seconds: 60 }),
        ];
        let report = await_all(ops, Duration::from_secs(1)).await;
        assert_eq!(report.completed, 2);
        assert!(report.all_completed());
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let failing = PendingOperation::new(
            OperationKind::RemoveKey,
            future::ready(Err(StoreError::Disconnected)).boxed(),
        );
        let ops = vec![failing, ok_op(OperationKind::RemoveKey)];
        let report = await_all(ops, Duration::from_secs(1)).await;
        assert_eq!(report.completed, 1);
        assert_eq!(
            report.failed,
            vec![(OperationKind::RemoveKey, StoreError::Disconnected)]
        );
        assert!(!report.all_completed());
        assert!(matches!(
            report.into_result(),
            Err(SessionError::RemoteOperationFailed { failed: 1, total: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_outstanding() {
        let stuck = PendingOperation::new(OperationKind::RemoveKey, future::pending().boxed());
        let ops = vec![stuck, ok_op(OperationKind::ExpireKey { seconds: 1 })];
        let report = await_all(ops, Duration::from_millis(1888)).await;
        assert_eq!(report.completed, 1);
        assert_eq!(report.outstanding, 1);
        assert!(report.timed_out());
        assert!(matches!(
            report.into_result(),
            Err(SessionError::TeardownTimeout { outstanding: 1, total: 2 })
        ));
    }

    #[test]
    fn test_pending_operations_take_all_drains() {
        let pending = PendingOperations::new();
        pending.push(ok_op(OperationKind::RemoveKey));
        pending.push(ok_op(OperationKind::ExpireKey { seconds: 5 }));
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending.kinds(),
            vec![OperationKind::RemoveKey, OperationKind::ExpireKey { seconds: 5 }]
        );
        let taken = pending.take_all();
        assert_eq!(taken.len(), 2);
        assert!(pending.is_empty());
    }
}
