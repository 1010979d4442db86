//! Server side: turn request text into a native call and its reply text.
//!
//! Every native block a call allocates is owned by an [`ArgSlot`], so it is
//! released on every exit path, including a failure part way through the
//! argument list. STANDARD values are released right after the native call;
//! result-bearing slots are released once the reply has been built, or
//! discarded unread when the call returned a non-zero status.

#![allow(unsafe_code)]

use super::envelope::{CallEnvelope, ReplyEnvelope};
use crate::codec;
use crate::config::WireConfig;
use crate::descriptor::{ArgumentDescriptor, InterfaceDescriptor, MethodDescriptor, PassingMode};
use crate::error::{DynRpcError, Result};
use crate::invoke::{self, ServiceTable};
use crate::native::NativeValue;
use serde_json::Value;
use std::ffi::c_void;
use tracing::{debug, error, warn};

/// Per-argument native storage for one call.
enum ArgSlot<'t> {
    /// Deserialized from the request.
    Standard(NativeValue<'t>),
    /// Instance of `T` for a `*T` argument; `cell` holds its address.
    PreAllocated {
        value: NativeValue<'t>,
        cell: Box<*mut u8>,
    },
    /// Zeroed pointer the callee fills for a `**T`/`*t` argument; `cell`
    /// holds the address of that pointer.
    Output {
        target: NativeValue<'t>,
        cell: Box<*mut u8>,
    },
    Handle(Box<*mut c_void>),
}

impl ArgSlot<'_> {
    /// Address libffi reads the argument value from.
    fn as_arg_ptr(&mut self) -> *mut c_void {
        match self {
            ArgSlot::Standard(value) => value.as_ptr().cast(),
            ArgSlot::PreAllocated { cell, .. } | ArgSlot::Output { cell, .. } => {
                (&mut **cell as *mut *mut u8).cast()
            }
            ArgSlot::Handle(handle) => (&mut **handle as *mut *mut c_void).cast(),
        }
    }
}

fn argument_error(method: &MethodDescriptor, arg: &ArgumentDescriptor, message: impl Into<String>) -> DynRpcError {
    DynRpcError::Argument {
        signature: method.signature().to_string(),
        index: arg.index(),
        message: message.into(),
    }
}

/// Handle one request against a service instance and return the reply text.
///
/// Local failures (malformed request, unknown signature, unsupported return
/// type, marshalling errors) are returned as `Err` and never rendered as a
/// reply. A non-zero native status is a normal outcome: `Ok("{\"e\":code}")`.
pub fn call(interface: &InterfaceDescriptor, service: &ServiceTable, request: &str) -> Result<String> {
    debug!("Parsing request: {}", request);
    let envelope = CallEnvelope::parse(request).inspect_err(|e| {
        error!("Rejecting request for interface {}: {}", interface.name(), e);
    })?;

    debug!("Looking for method {}", envelope.method);
    let method = interface.method(&envelope.method).ok_or_else(|| {
        error!("Cannot find method with signature '{}'", envelope.method);
        DynRpcError::MethodNotFound {
            signature: envelope.method.clone(),
        }
    })?;

    invoke_method(method, service, &envelope.args)
}

/// Invoke an already resolved method with the request's wire arguments.
pub fn invoke_method(method: &MethodDescriptor, service: &ServiceTable, wire_args: &[Value]) -> Result<String> {
    if !method.return_type().is_native_int() {
        error!(
            "Only methods returning a native int are supported; '{}' returns '{}'",
            method.signature(),
            method.return_type()
        );
        return Err(DynRpcError::UnsupportedReturnType {
            signature: method.signature().to_string(),
            found: method.return_type().to_string(),
        });
    }
    let function = service.function(method.index())?;

    let mut slots = build_slots(method, service, wire_args)?;
    let mut arg_ptrs: Vec<*mut c_void> = slots.iter_mut().map(ArgSlot::as_arg_ptr).collect();

    // SAFETY: the descriptor was resolved for this service table, the return
    // type was checked above, and every pointer in `arg_ptrs` refers to
    // storage owned by `slots`, which outlives the call.
    let status = unsafe { invoke::call(method, function, &mut arg_ptrs) };

    // STANDARD values are only lent to the callee for the duration of the call.
    let outputs: Vec<ArgSlot<'_>> = slots
        .into_iter()
        .filter(|slot| !matches!(slot, ArgSlot::Standard(_)))
        .collect();

    if status != WireConfig::STATUS_OK {
        warn!(
            "Error calling remote endpoint function '{}', got error code {}",
            method.signature(),
            status
        );
        return ReplyEnvelope::failure(status).to_text();
    }

    let result = serialize_result(method, &outputs)?;
    drop(outputs);

    let reply = ReplyEnvelope::success(result).to_text()?;
    debug!("Reply for '{}': {}", method.signature(), reply);
    Ok(reply)
}

fn build_slots<'t>(
    method: &'t MethodDescriptor,
    service: &ServiceTable,
    wire_args: &[Value],
) -> Result<Vec<ArgSlot<'t>>> {
    let mut slots = Vec::with_capacity(method.arguments().len());
    let mut wire = wire_args.iter();

    for arg in method.arguments() {
        let slot = match arg.mode() {
            PassingMode::Standard => {
                let value = wire
                    .next()
                    .ok_or_else(|| argument_error(method, arg, "missing from request"))?;
                let native = codec::deserialize(arg.ty(), value)
                    .map_err(|e| argument_error(method, arg, e.to_string()))?;
                ArgSlot::Standard(native)
            }
            PassingMode::PreAllocatedOutput => {
                let value = NativeValue::alloc(arg.value_type())?;
                let cell = Box::new(value.as_ptr());
                ArgSlot::PreAllocated { value, cell }
            }
            PassingMode::Output => {
                let target = NativeValue::alloc(arg.value_type())?;
                let cell = Box::new(target.as_ptr());
                ArgSlot::Output { target, cell }
            }
            PassingMode::Handle => ArgSlot::Handle(Box::new(service.handle())),
        };
        slots.push(slot);
    }

    let extra = wire.count();
    if extra > 0 {
        warn!(
            "Ignoring {} surplus argument(s) in request for '{}'",
            extra,
            method.signature()
        );
    }
    Ok(slots)
}

/// Serialize the result-bearing slot, if the method has one and it was filled.
fn serialize_result(method: &MethodDescriptor, outputs: &[ArgSlot<'_>]) -> Result<Option<Value>> {
    // Descriptors carry at most one result-bearing argument, so at most one
    // slot below produces a value.
    let mut result = None;
    for slot in outputs {
        match slot {
            ArgSlot::PreAllocated { value, .. } => {
                result = Some(codec::serialize_value(value)?);
            }
            ArgSlot::Output { target, .. } if target.is_null_pointer() => {
                debug!("Output pointer of '{}' is null", method.signature());
            }
            ArgSlot::Output { target, .. } => {
                result = Some(codec::serialize_value(target)?);
            }
            ArgSlot::Standard(_) | ArgSlot::Handle(_) => {}
        }
    }
    Ok(result)
}
