//! JSON remote invocation over descriptor-described native functions.
//!
//! # Architecture
//!
//! - **Dispatch**: Server side, turns a request into a native call and a reply
//! - **Client**: Encodes a local call into a request and applies the reply
//! - **Envelope**: Wire types shared by both

pub mod client;
pub mod dispatch;
pub mod envelope;

pub use client::{handle_reply, prepare_invoke_request};
pub use dispatch::call;
pub use envelope::{CallEnvelope, ReplyEnvelope};
