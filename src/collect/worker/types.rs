/// How one processing attempt of an item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Record persisted and checkpoint cleared.
    Collected,
    /// Attempt failed; the item went back to the tail of the queue with a bumped retry count.
    Requeued,
    /// Attempt failed at the retry ceiling; the item went to the permanent-failure log.
    FailedPermanently,
    /// The slot's token fired mid-item; the checkpoint stays for whoever resumes the slot.
    Cancelled,
    /// The monitor detached this task while it was working; the slot is no longer ours.
    Stale,
}

impl ItemOutcome {
    /// Whether the worker loop should keep pulling items after this outcome.
    pub(super) fn keeps_running(self) -> bool {
        matches!(
            self,
            ItemOutcome::Collected | ItemOutcome::Requeued | ItemOutcome::FailedPermanently
        )
    }
}
