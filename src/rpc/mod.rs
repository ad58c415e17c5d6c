//! Line-delimited JSON-RPC 2.0 over stdio: framing, dispatch, and the
//! serialized writer.

pub mod methods;
pub mod server;
pub mod types;

pub use server::{run, Outbound, ServerState};
