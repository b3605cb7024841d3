use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use super::pending::{PendingCalls, Ticket};

/// Holds confirmation-gated calls until someone approves or rejects them.
///
/// Gates are addressed by execution id and tool-use id; the execution id is
/// the stream handle's pid.
#[derive(Clone, Default)]
pub struct ConfirmationBroker {
    pending: PendingCalls<bool>,
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers the gate for `tool_use_id` in `execution_id`. Returns false when
    /// nothing waits for it.
    pub fn confirm(&self, execution_id: Uuid, tool_use_id: &str, approved: bool) -> bool {
        self.pending.answer(execution_id, tool_use_id, approved)
    }

    pub fn pending(&self) -> Vec<(Uuid, String)> {
        self.pending.keys()
    }

    /// Registers the gate. Must happen before the confirmation request is announced.
    pub(crate) fn register(&self, execution_id: Uuid, tool_use_id: &str) -> Gate {
        let (ticket, rx) = self.pending.register(execution_id, tool_use_id);
        Gate { _ticket: ticket, rx }
    }
}

/// One registered gate. Dropping it, answered or not, withdraws the registration.
pub(crate) struct Gate {
    _ticket: Ticket<bool>,
    rx: oneshot::Receiver<bool>,
}

impl Gate {
    /// Waits for the answer. Silence past `grace` counts as a denial.
    pub(crate) async fn wait(self, grace: Duration) -> bool {
        matches!(tokio::time::timeout(grace, self.rx).await, Ok(Ok(true)))
    }
}
