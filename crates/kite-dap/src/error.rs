use thiserror::Error;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Rdp(#[from] kite_rdp::RdpError),

    #[error("not connected to a runtime")]
    NotConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown variablesReference {0}")]
    UnknownVariablesReference(i64),

    #[error("unknown source reference {0}")]
    UnknownSourceReference(i64),

    #[error("no call stack available")]
    NoCallStack,

    #[error("invalid stack frame {0}")]
    InvalidStackFrame(i64),

    #[error("{0}")]
    Evaluate(String),
}
