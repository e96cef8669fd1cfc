use thiserror::Error;

/// Convenience alias for `Result<T, VerifyError>`.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Run-level error taxonomy.
///
/// - `Configuration` is fatal before any phase runs.
/// - `Connection` is fatal for the primary; replica connection failures are
///   recorded in that replica's results instead of surfacing here.
/// - `Write` is fatal and implies the batch was rolled back.
/// - `Query` is a phase-level query failure against the primary.
/// - `RoleVerification` aborts the run before any write happens.
/// - `Task` marks a per-replica task that panicked or was cancelled.
///
/// Probe timeouts and individual lookup failures are measurement values,
/// never errors.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot connect to {endpoint}: {cause:#}")]
    Connection {
        endpoint: String,
        cause: anyhow::Error,
    },

    #[error("write on primary failed (batch rolled back): {0:#}")]
    Write(anyhow::Error),

    #[error("query on {endpoint} failed: {cause:#}")]
    Query {
        endpoint: String,
        cause: anyhow::Error,
    },

    #[error("replica role verification failed: {0}")]
    RoleVerification(String),

    #[error("task for {replica} did not complete: {detail}")]
    Task { replica: String, detail: String },
}

impl VerifyError {
    /// True for errors that stop the run before any phase executes.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
