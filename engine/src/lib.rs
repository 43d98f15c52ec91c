//! Connection state machine, request dispatcher, argument recoder, and
//! dump/restore streamers for the binary frontend protocol (spec section 4
//! and 5). Sits on top of [`db_wire`] (the wire codec) and [`db_auth`] (the
//! SCRAM/Trust handshake), and is driven by [`listener::serve`] once a
//! concrete [`backend::Backend`] and [`compile::Compiler`] are supplied.

pub mod backend;
pub mod compile;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod dump;
pub mod error;
pub mod listener;
pub mod recoder;
pub mod restore;
pub mod session;

pub use backend::{Backend, BackendError};
pub use compile::Compiler;
pub use config::{ListenerConfig, StaticConfig};
pub use connection::{AuthPolicy, CancelFlag, Connection, Phase};
pub use dispatcher::{dispatch, Dispatched};
pub use dump::DumpStreamer;
pub use error::ConnectionError;
pub use listener::serve;
pub use restore::RestoreSession;
pub use session::SessionView;
