//! Palaver is a chat agent backend demonstrating human-in-the-loop tool
//! confirmation over a remote MCP tool server.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] talks to the tool server: connection lifecycle, the schema
//!   translator, the per-turn tool registry, confirmation-gated execution,
//!   and the pending-call resolver.
//! - [`core`] owns the conversation: transcript and invocation state,
//!   per-user sessions and confirmation signals, model streaming, and the
//!   turn driver that merges text and tool events into one outgoing stream.
//! - [`api`] defines the chat-completion payloads exchanged with the model
//!   provider.
//!
//! The binary (`src/main.rs`) wraps this in a line-oriented REPL that
//! renders turn events and feeds approve/reject decisions back in.

pub mod api;
pub mod core;
pub mod mcp;
