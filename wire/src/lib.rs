//! Wire-format types for the binary frontend protocol: frame codec,
//! client/server message bodies, and the shared data model (capabilities,
//! session state, error taxonomy).

pub mod client_message;
pub mod codec;
pub mod common;
pub mod error;
pub mod frame;
pub mod server_message;

pub mod prelude {
    pub use crate::client_message::{self, ClientMessage};
    pub use crate::common::*;
    pub use crate::error::{DecodeError, EdbError};
    pub use crate::frame::{FrameReader, FrameWriter};
    pub use crate::server_message::{self, ServerMessage};
}
