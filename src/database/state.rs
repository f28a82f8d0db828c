use std::fmt;

/// Lifecycle of a [`Database`](super::Database) handle.
///
/// `Unopened → MigrationsPending → MigrationsApplying → Ready`. `Failed` is terminal
/// and reachable from a refused driver open or either init phase; `Closed` follows
/// `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    Unopened,
    MigrationsPending,
    MigrationsApplying,
    Ready,
    Failed,
    Closed,
}

impl HandleState {
    /// Whether statements may be issued. Init phases accept them so migrations and
    /// plugin setup can reach the driver.
    #[must_use]
    pub fn accepts_queries(self) -> bool {
        matches!(
            self,
            HandleState::MigrationsPending | HandleState::MigrationsApplying | HandleState::Ready
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, HandleState::Failed | HandleState::Closed)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandleState::Unopened => "unopened",
            HandleState::MigrationsPending => "pending migrations",
            HandleState::MigrationsApplying => "applying migrations",
            HandleState::Ready => "ready",
            HandleState::Failed => "failed",
            HandleState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_live_states_accept_queries() {
        assert!(HandleState::Ready.accepts_queries());
        assert!(HandleState::MigrationsApplying.accepts_queries());
        assert!(!HandleState::Unopened.accepts_queries());
        assert!(!HandleState::Failed.accepts_queries());
        assert!(!HandleState::Closed.accepts_queries());
        assert!(HandleState::Closed.is_terminal());
        assert_eq!(HandleState::Failed.to_string(), "failed");
    }
}
