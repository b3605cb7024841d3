use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::ExecutionStatus;

/// Live view of one execution: id, status and cancellation.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pid: Uuid,
    status: watch::Receiver<ExecutionStatus>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn pid(&self) -> Uuid {
        self.pid
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    /// Signals cancellation. The execution stops at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits until the execution leaves `Running`.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| *s != ExecutionStatus::Running)
            .await
            .map(|s| *s);
        settled.unwrap_or_else(|_| *status.borrow())
    }
}

/// Write side of the status channel, owned by the running execution.
///
/// Dropping it while still `Running` (the execution future was dropped)
/// marks the execution failed.
#[derive(Debug)]
pub struct StatusReporter {
    tx: watch::Sender<ExecutionStatus>,
}

impl StatusReporter {
    pub fn new(pid: Uuid, cancel: CancellationToken) -> (Self, ExecutionHandle) {
        let (tx, rx) = watch::channel(ExecutionStatus::Running);
        (
            Self { tx },
            ExecutionHandle {
                pid,
                status: rx,
                cancel,
            },
        )
    }

    pub fn finish(&self, status: ExecutionStatus) {
        self.tx.send_replace(status);
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.tx.send_if_modified(|status| {
            if *status == ExecutionStatus::Running {
                *status = ExecutionStatus::Failed;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_final_status() {
        let (reporter, handle) = StatusReporter::new(Uuid::new_v4(), CancellationToken::new());
        assert_eq!(handle.status(), ExecutionStatus::Running);
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        reporter.finish(ExecutionStatus::Completed);
        assert_eq!(waiter.await.unwrap(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_dropped_reporter_marks_failed() {
        let (reporter, handle) = StatusReporter::new(Uuid::new_v4(), CancellationToken::new());
        drop(reporter);
        assert_eq!(handle.wait().await, ExecutionStatus::Failed);
    }

    #[test]
    fn test_cancel_is_shared() {
        let token = CancellationToken::new();
        let (_reporter, handle) = StatusReporter::new(Uuid::new_v4(), token.clone());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }
}
