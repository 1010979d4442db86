//! Type/method model queried by the marshaller.
//!
//! Descriptors are parsed once when an interface is loaded and are immutable
//! afterwards, so one `InterfaceDescriptor` can be shared by every concurrent
//! call against that interface.

mod function;
mod interface;
mod types;

pub use function::{ArgumentDescriptor, MethodDescriptor, PassingMode};
pub use interface::InterfaceDescriptor;
pub use types::{DynType, Field, Primitive, StructType, TypeRegistry};
