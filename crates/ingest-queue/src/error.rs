/// Errors surfaced by [`crate::queue::ContributionQueue`].
///
/// `Database` wraps every `sqlx` failure; [`QueueError::is_transient`]
/// classifies dropped connections, "server has gone away", and
/// serialization/deadlock aborts as retryable -- everything else
/// (constraint violations, bad SQL) is not.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("contribution queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("contribution queue invariant violated: {0}")]
    Invariant(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Database(err) => is_transient_db_error(err),
            QueueError::Invariant(_) => false,
        }
    }
}

/// Postgres SQLSTATE classes treated as transient: connection exceptions
/// (class 08), serialization failures and deadlocks (40001, 40P01), and
/// the server shutting down under us (57P0x).
const TRANSIENT_SQLSTATES: [&str; 8] = [
    "08000", "08003", "08004", "08006", "08001", "40001", "40P01", "57P03",
];

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err = QueueError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.is_transient());
    }

    #[test]
    fn invariant_errors_are_never_transient() {
        let err = QueueError::Invariant("bad combination".to_string());
        assert!(!err.is_transient());
    }
}
