//! Method descriptors: `name(ARGS)RET` with per-argument passing modes.

use super::types::{DynType, TypeParser, TypeRegistry};
use crate::config::DescriptorConfig;
use crate::error::{DynRpcError, Result};

/// How an argument crosses the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassingMode {
    /// Carried in the request `a` array, deserialized for the callee.
    Standard,
    /// `*T`: storage for a `T` is allocated for the callee to fill; surfaces in `r`.
    PreAllocatedOutput,
    /// `**T` or `*t`: the callee allocates and writes back a pointer; surfaces in `r`.
    Output,
    /// `P`: the service's opaque handle, never on the wire.
    Handle,
}

impl PassingMode {
    fn from_meta(value: &str) -> Option<Self> {
        match value {
            "std" => Some(PassingMode::Standard),
            "pre" => Some(PassingMode::PreAllocatedOutput),
            "out" => Some(PassingMode::Output),
            "handle" => Some(PassingMode::Handle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PassingMode::Standard => "std",
            PassingMode::PreAllocatedOutput => "pre",
            PassingMode::Output => "out",
            PassingMode::Handle => "handle",
        }
    }

    /// True for the modes whose value is published in the reply `r` field.
    pub fn carries_result(self) -> bool {
        matches!(self, PassingMode::PreAllocatedOutput | PassingMode::Output)
    }
}

/// One argument of a method: its native type and passing mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentDescriptor {
    index: usize,
    ty: DynType,
    mode: PassingMode,
}

impl ArgumentDescriptor {
    /// Position in the native argument list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declared type of the argument as the callee sees it.
    pub fn ty(&self) -> &DynType {
        &self.ty
    }

    pub fn mode(&self) -> PassingMode {
        self.mode
    }

    /// Type of the value that is marshalled for this argument.
    ///
    /// For result-bearing modes this is one level below the declared type:
    /// `T` for a `*T` pre-allocated output, `*T` or `t` for an output.
    pub fn value_type(&self) -> &DynType {
        match self.mode {
            PassingMode::PreAllocatedOutput | PassingMode::Output => {
                self.ty.pointee().unwrap_or(&self.ty)
            }
            PassingMode::Standard | PassingMode::Handle => &self.ty,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self.mode {
            PassingMode::Standard => Ok(()),
            PassingMode::Handle if self.ty == DynType::Untyped => Ok(()),
            PassingMode::Handle => Err("handle argument must be 'P'".to_string()),
            PassingMode::PreAllocatedOutput if self.ty.pointee().is_some() => Ok(()),
            PassingMode::PreAllocatedOutput => {
                Err("pre-allocated output must be a typed pointer '*T'".to_string())
            }
            PassingMode::Output => match self.ty.pointee() {
                Some(DynType::Pointer(_)) | Some(DynType::Text) => Ok(()),
                _ => Err("output must be a pointer to a pointer ('**T' or '*t')".to_string()),
            },
        }
    }
}

/// Immutable description of one invocable method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    signature: String,
    index: usize,
    name: String,
    arguments: Vec<ArgumentDescriptor>,
    return_type: DynType,
}

impl MethodDescriptor {
    /// Parse a function descriptor registered under `signature` at `index`.
    ///
    /// Rejects methods with more than one result-bearing argument, since a
    /// reply carries a single `r` value.
    pub fn parse(
        signature: &str,
        index: usize,
        descriptor: &str,
        types: &TypeRegistry,
    ) -> Result<Self> {
        let mut parser = TypeParser::new(descriptor, types);

        let name = parser.take_until(b'(')?;
        if name.is_empty() {
            return Err(parser.error("missing function name"));
        }

        let mut arguments = Vec::new();
        while parser.peek() != Some(b')') {
            if parser.peek().is_none() {
                return Err(parser.error("unterminated argument list"));
            }
            let meta = parser.parse_meta()?;
            let mode = match meta
                .iter()
                .find(|(key, _)| key == DescriptorConfig::ARGUMENT_META_KEY)
            {
                Some((_, value)) => PassingMode::from_meta(value)
                    .ok_or_else(|| parser.error(format!("unknown argument meta '{}'", value)))?,
                None => PassingMode::Standard,
            };
            let ty = parser.parse_value_type(0)?;
            let argument = ArgumentDescriptor {
                index: arguments.len(),
                ty,
                mode,
            };
            argument
                .validate()
                .map_err(|message| parser.error(format!("argument {}: {}", argument.index, message)))?;
            arguments.push(argument);
        }
        parser.expect(b')')?;
        let return_type = parser.parse_type(0)?;
        parser.finish()?;

        let results = arguments.iter().filter(|a| a.mode.carries_result()).count();
        if results > 1 {
            return Err(DynRpcError::type_descriptor(
                descriptor,
                format!("{} result-bearing arguments; at most one is allowed", results),
            ));
        }

        Ok(Self {
            signature: signature.to_string(),
            index,
            name,
            arguments,
            return_type,
        })
    }

    /// Key used on the wire (`m`); unique within an interface.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Position of the method in the service's function table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Native function name from the descriptor.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[ArgumentDescriptor] {
        &self.arguments
    }

    pub fn return_type(&self) -> &DynType {
        &self.return_type
    }

    /// The argument whose value is published in the reply, if any.
    pub fn result_argument(&self) -> Option<&ArgumentDescriptor> {
        self.arguments.iter().find(|a| a.mode.carries_result())
    }

    /// Number of values the request `a` array carries.
    pub fn wire_argument_count(&self) -> usize {
        self.arguments
            .iter()
            .filter(|a| a.mode == PassingMode::Standard)
            .count()
    }
}
