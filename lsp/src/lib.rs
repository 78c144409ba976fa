//! Language Server Protocol front end for ink-ls.
//!
//! Frames JSON-RPC over a byte stream, answers the editor's requests and
//! hands document and workspace events to the engine's orchestrator.

mod client;
pub mod codec;
pub mod protocol;
mod server;

pub use server::{ServerOptions, SessionEnd, serve};
