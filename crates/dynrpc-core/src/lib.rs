//! DynRpc Core - JSON remote invocation for descriptor-described C services.
//!
//! An interface descriptor lists the methods of a service together with the
//! native types of their arguments. From that alone the crate can turn a
//! JSON request into a native call against the service's function table and
//! render the result as a JSON reply, and do the reverse on the calling side.
//!
//! # Example
//!
//! ```rust,ignore
//! use dynrpc_core::{rpc, InterfaceDescriptor, ServiceTable};
//!
//! fn serve(service: &ServiceTable) -> dynrpc_core::Result<()> {
//!     let interface = InterfaceDescriptor::load("calculator.descriptor")?;
//!
//!     let reply = rpc::call(&interface, service, r#"{"m":"add(DD)D","a":[2.0,3.0]}"#)?;
//!     assert_eq!(reply, r#"{"r":5.0}"#);
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod invoke;
pub mod native;
pub mod rpc;

// Re-export commonly used types
pub use config::{DescriptorConfig, WireConfig};
pub use descriptor::{
    ArgumentDescriptor, DynType, InterfaceDescriptor, MethodDescriptor, PassingMode, Primitive,
};
pub use error::{DynRpcError, ErrorKind, Result};
pub use invoke::{NativeFn, ServiceTable};
pub use native::{live_allocations, NativeValue};
pub use rpc::{CallEnvelope, ReplyEnvelope};
