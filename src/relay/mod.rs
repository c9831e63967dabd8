//! Server side: one client connection paired with one agent connection.

pub mod server;
pub mod session;

pub use server::{RelayServer, extract_token, relay_connection};
pub use session::{Action, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, Frame, RelaySession, SessionState};
