//! The connection-level error type: wraps [`db_wire::EdbError`] the way
//! `gel-auth`'s `ConnectionError` wraps its protocol error, adding the I/O
//! and cancellation cases that only make sense once a transport is
//! attached.

use db_wire::error::EdbError;

#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum ConnectionError {
    #[display("{_0}")]
    Protocol(EdbError),
    #[display("io error: {_0}")]
    Io(std::io::Error),
    #[display("connection cancelled")]
    #[error(ignore)]
    Cancelled,
}

impl From<db_wire::error::DecodeError> for ConnectionError {
    fn from(e: db_wire::error::DecodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

impl ConnectionError {
    pub fn as_edb_error(&self) -> Option<EdbError> {
        match self {
            ConnectionError::Protocol(e) => Some(*e),
            _ => None,
        }
    }
}
