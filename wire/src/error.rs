//! The error taxonomy from the protocol design: one variant per kind of
//! failure a connection can report to a client, each carrying the wire code
//! sent in an `ErrorResponse` message.

/// A server-side error with a wire error code, matching the kinds a client
/// can distinguish on the wire (spec section 7, "Error taxonomy").
///
/// Numeric codes are assigned here rather than reusing an upstream table,
/// since the upstream `EdbError` code values are not part of this crate's
/// lineage; see DESIGN.md for the resolution of this open question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EdbError {
    #[display("protocol error")]
    ProtocolError,
    #[display("unsupported protocol version")]
    UnsupportedProtocolVersionError,
    #[display("unsupported feature")]
    UnsupportedFeatureError,
    #[display("authentication failed")]
    AuthenticationError,
    #[display("invalid input data")]
    InputDataError,
    #[display("query error")]
    QueryError,
    #[display("state mismatch")]
    StateMismatchError,
    #[display("backend error")]
    BackendError,
    #[display("server is not available")]
    AvailabilityError,
    #[display("idle connection timed out")]
    IdleSessionTimeoutError,
    #[display("operation was cancelled")]
    ClientConnectionClosedError,
    #[display("internal server error")]
    InternalServerError,
}

impl EdbError {
    /// The code sent on the wire in an `ErrorResponse` message.
    pub fn code(self) -> u32 {
        match self {
            EdbError::InternalServerError => 0x01_00_00_00,
            EdbError::UnsupportedFeatureError => 0x01_00_03_00,
            EdbError::ProtocolError => 0x02_00_00_00,
            EdbError::UnsupportedProtocolVersionError => 0x02_00_01_00,
            EdbError::BackendError => 0x02_00_02_00,
            EdbError::StateMismatchError => 0x02_00_03_00,
            EdbError::QueryError => 0x03_00_00_00,
            EdbError::InputDataError => 0x04_00_00_00,
            EdbError::AuthenticationError => 0x07_00_00_00,
            EdbError::AvailabilityError => 0x08_00_00_00,
            EdbError::ClientConnectionClosedError => 0x08_00_02_00,
            EdbError::IdleSessionTimeoutError => 0x08_00_03_00,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        [
            EdbError::InternalServerError,
            EdbError::UnsupportedFeatureError,
            EdbError::ProtocolError,
            EdbError::UnsupportedProtocolVersionError,
            EdbError::BackendError,
            EdbError::StateMismatchError,
            EdbError::QueryError,
            EdbError::InputDataError,
            EdbError::AuthenticationError,
            EdbError::AvailabilityError,
            EdbError::ClientConnectionClosedError,
            EdbError::IdleSessionTimeoutError,
        ]
        .into_iter()
        .find(|e| e.code() == code)
    }
}

impl std::error::Error for EdbError {}

/// Errors raised while decoding a frame or a typed message from the wire.
#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
#[non_exhaustive]
pub enum DecodeError {
    #[display("unexpected end of frame")]
    Underflow,
    #[display("frame contains extra data after decoding")]
    ExtraData,
    #[display("invalid utf8 in decoded string: {_0}")]
    InvalidUtf8(#[error(source)] std::str::Utf8Error),
    #[display("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: u32, limit: u32 },
    #[display("malformed frame length")]
    BadLength,
    #[display("unknown message type {tag:#04x} in {context}")]
    UnknownMessageType { tag: u8, context: &'static str },
    #[display("unsupported cardinality: {_0:#04x}")]
    InvalidCardinality(u8),
    #[display("unsupported input language: {_0:#04x}")]
    InvalidInputLanguage(u8),
    #[display("unsupported output format: {_0:#04x}")]
    InvalidIoFormat(u8),
    #[display("non-zero reserved field")]
    NonZeroReserved,
    #[display("invalid uuid: {_0}")]
    InvalidUuid(#[error(source)] uuid::Error),
}

impl From<DecodeError> for EdbError {
    fn from(_: DecodeError) -> Self {
        EdbError::ProtocolError
    }
}
