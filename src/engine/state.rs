use std::fmt;

/// Lifecycle of one issuance attempt on the pipeline side.
///
/// `Pending` (published) -> `Processing` (picked up by a consumer) ->
/// `Succeeded` | `Failed`. Every attempt that reaches a consumer ends in a
/// terminal state with exactly one outcome emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Pending => "pending",
            AttemptState::Processing => "processing",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a caller waiting on an attempt, loosely coupled to [`AttemptState`].
///
/// A timed out wait does not cancel processing; an outcome that arrives with no
/// registered waiter is `Orphaned` and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Waiting,
    Resolved,
    TimedOut,
    Orphaned,
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WaitState::Waiting => "waiting",
            WaitState::Resolved => "resolved",
            WaitState::TimedOut => "timed_out",
            WaitState::Orphaned => "orphaned",
        };
        f.write_str(name)
    }
}
