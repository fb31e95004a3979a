use codec::{Fault, faults};

/// Error taxonomy of the communication core.
///
/// Receive-path errors are turned into fault replies where a fault name
/// exists for them (`to_fault`), and absorbed otherwise so the reactors
/// stay alive. Send-path errors propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("no transport factory for scheme {0:?}")]
    UnsupportedMedium(String),

    #[error("no protocol factory named {0:?}")]
    UnsupportedProtocol(String),

    /// Benign race against a concurrent close; never fatal.
    #[error("channel is closing")]
    ChannelClosing,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("correlation failed: {0}")]
    CorrelationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid redirection: {0}")]
    InvalidRedirection(String),

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Frame(#[from] codec::FrameError),

    #[error("configuration: {0}")]
    Config(String),
}

impl CommError {
    /// Fault reply carried back to the peer, when this error has one.
    pub fn to_fault(&self) -> Option<Fault> {
        match self {
            Self::TypeMismatch(detail) => Some(Fault::new(faults::TYPE_MISMATCH, detail.clone())),
            Self::CorrelationError(detail) => {
                Some(Fault::new(faults::CORRELATION_ERROR, detail.clone()))
            }
            Self::InvalidOperation(name) => Some(Fault::new(
                faults::IO_EXCEPTION,
                format!("Invalid operation: {name}"),
            )),
            Self::InvalidRedirection(name) => Some(Fault::new(
                faults::IO_EXCEPTION,
                format!("Invalid redirection: {name}"),
            )),
            Self::UnsupportedMedium(scheme) => Some(Fault::new(
                faults::IO_EXCEPTION,
                format!("no transport factory for scheme {scheme:?}"),
            )),
            Self::UnsupportedProtocol(name) => Some(Fault::new(
                faults::IO_EXCEPTION,
                format!("no protocol factory named {name:?}"),
            )),
            Self::Io(e) => Some(Fault::new(faults::IO_EXCEPTION, e.to_string())),
            _ => None,
        }
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ChannelClosing)
    }
}
