use thiserror::Error;

/// Errors raised by the interactive session bridge.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The external process could not be started or never became ready.
    /// Fatal to the whole run.
    #[error("failed to initialize interactive session: {0}")]
    Initialization(String),

    /// No confirmed answer arrived within the exchange deadline. Recovered
    /// locally by substituting the fallback comment.
    #[error("no response received within {timeout_secs} seconds")]
    ResponseTimeout { timeout_secs: u64 },

    /// Cooperative shutdown interrupted the exchange. Always propagated.
    #[error("exchange cancelled by shutdown")]
    Cancelled,

    #[error("session I/O error: {0}")]
    Io(String),
}

/// Errors raised by the socket client loop.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport drop or unexpected close. Triggers reconnect with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// Failed send on the outbound transport. Treated as a connection error
    /// by the reconnect loop.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Cooperative shutdown propagated through the client loop.
    #[error("cancelled")]
    Cancelled,
}
