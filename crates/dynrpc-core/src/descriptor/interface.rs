//! Interface descriptor documents.
//!
//! A descriptor is line oriented and split into sections that must appear in
//! this order (only `:header` is mandatory):
//!
//! ```text
//! :header
//! type=interface
//! name=calculator
//! version=1.0.0
//! :annotations
//! classname=org.example.Calculator
//! :types
//! StatsResult={DDD[D average min max input}
//! :methods
//! add(DD)D=add(#am=handle;PDD#am=pre;*D)N
//! ```
//!
//! The position of a method in `:methods` is its index in the service's
//! function table.

use super::function::MethodDescriptor;
use super::types::{DynType, TypeRegistry};
use crate::config::DescriptorConfig;
use crate::error::{DynRpcError, Result};
use semver::Version;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Header,
    Annotations,
    Types,
    Methods,
}

impl Section {
    fn from_line(line: &str) -> Option<Self> {
        match line {
            DescriptorConfig::HEADER_SECTION => Some(Section::Header),
            DescriptorConfig::ANNOTATIONS_SECTION => Some(Section::Annotations),
            DescriptorConfig::TYPES_SECTION => Some(Section::Types),
            DescriptorConfig::METHODS_SECTION => Some(Section::Methods),
            _ => None,
        }
    }
}

/// Parsed, immutable model of one service interface.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    name: String,
    version: Version,
    header: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    types: TypeRegistry,
    methods: Vec<MethodDescriptor>,
}

fn at_line(line: usize, err: DynRpcError) -> DynRpcError {
    match err {
        DynRpcError::Descriptor { .. } => err,
        other => DynRpcError::Descriptor {
            line,
            message: other.to_string(),
        },
    }
}

fn insert_unique(
    map: &mut BTreeMap<String, String>,
    line: usize,
    key: &str,
    value: &str,
) -> Result<()> {
    if map.insert(key.to_string(), value.to_string()).is_some() {
        return Err(DynRpcError::Descriptor {
            line,
            message: format!("duplicate key '{}'", key),
        });
    }
    Ok(())
}

impl InterfaceDescriptor {
    /// Parse a descriptor document.
    pub fn parse(text: &str) -> Result<Self> {
        let mut section: Option<Section> = None;
        let mut header = BTreeMap::new();
        let mut annotations = BTreeMap::new();
        let mut types = TypeRegistry::new();
        let mut methods: Vec<MethodDescriptor> = Vec::new();

        for (number, raw) in text.lines().enumerate() {
            let line_no = number + 1;
            let line = raw.trim_end();
            if line.trim_start().is_empty() {
                continue;
            }

            if line.starts_with(':') {
                let next = Section::from_line(line).ok_or_else(|| DynRpcError::Descriptor {
                    line: line_no,
                    message: format!("unknown section '{}'", line),
                })?;
                match section {
                    None if next != Section::Header => {
                        return Err(DynRpcError::Descriptor {
                            line: line_no,
                            message: format!(
                                "descriptor must start with '{}'",
                                DescriptorConfig::HEADER_SECTION
                            ),
                        });
                    }
                    Some(current) if next <= current => {
                        return Err(DynRpcError::Descriptor {
                            line: line_no,
                            message: format!("section '{}' is repeated or out of order", line),
                        });
                    }
                    _ => {}
                }
                section = Some(next);
                continue;
            }

            let Some(current) = section else {
                return Err(DynRpcError::Descriptor {
                    line: line_no,
                    message: "entry before the first section".to_string(),
                });
            };
            let (key, value) = line.split_once('=').ok_or_else(|| DynRpcError::Descriptor {
                line: line_no,
                message: format!("expected 'key=value', got '{}'", line),
            })?;

            match current {
                Section::Header => insert_unique(&mut header, line_no, key, value)?,
                Section::Annotations => insert_unique(&mut annotations, line_no, key, value)?,
                Section::Types => {
                    if types.contains_key(key) {
                        return Err(DynRpcError::Descriptor {
                            line: line_no,
                            message: format!("duplicate type '{}'", key),
                        });
                    }
                    let ty = DynType::parse_with(value, &types).map_err(|e| at_line(line_no, e))?;
                    types.insert(key.to_string(), ty);
                }
                Section::Methods => {
                    if methods.iter().any(|m| m.signature() == key) {
                        return Err(DynRpcError::Descriptor {
                            line: line_no,
                            message: format!("duplicate method signature '{}'", key),
                        });
                    }
                    let method = MethodDescriptor::parse(key, methods.len(), value, &types)
                        .map_err(|e| at_line(line_no, e))?;
                    methods.push(method);
                }
            }
        }

        if section.is_none() {
            return Err(DynRpcError::Descriptor {
                line: 0,
                message: "empty descriptor".to_string(),
            });
        }

        let missing = |key: &str| DynRpcError::Descriptor {
            line: 0,
            message: format!("header is missing '{}'", key),
        };
        let kind = header.get("type").ok_or_else(|| missing("type"))?;
        if kind != DescriptorConfig::INTERFACE_TYPE {
            return Err(DynRpcError::Descriptor {
                line: 0,
                message: format!("unsupported descriptor type '{}'", kind),
            });
        }
        let name = header.get("name").ok_or_else(|| missing("name"))?.clone();
        let version_text = header.get("version").ok_or_else(|| missing("version"))?;
        let version = Version::parse(version_text).map_err(|e| DynRpcError::Descriptor {
            line: 0,
            message: format!("invalid version '{}': {}", version_text, e),
        })?;

        debug!(
            "Parsed interface {} {} with {} methods",
            name,
            version,
            methods.len()
        );

        Ok(Self {
            name,
            version,
            header,
            annotations,
            types,
            methods,
        })
    }

    /// Load and parse a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| DynRpcError::io_with_path(e, path))?;

        let mut text = String::new();
        file.take(DescriptorConfig::MAX_DESCRIPTOR_BYTES + 1)
            .read_to_string(&mut text)
            .map_err(|e| DynRpcError::io_with_path(e, path))?;
        if text.len() as u64 > DescriptorConfig::MAX_DESCRIPTOR_BYTES {
            return Err(DynRpcError::Io {
                message: format!(
                    "descriptor exceeds maximum size of {} bytes",
                    DescriptorConfig::MAX_DESCRIPTOR_BYTES
                ),
                path: Some(path.to_path_buf()),
                source: None,
            });
        }

        Self::parse(&text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Raw header entry, e.g. `type`.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn named_type(&self, name: &str) -> Option<&DynType> {
        self.types.get(name)
    }

    /// Methods in function-table order.
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Find a method by exact (case-sensitive) signature.
    pub fn method(&self, signature: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.signature() == signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PassingMode;
    use std::io::Write;

    const CALCULATOR: &str = "\
:header
type=interface
name=calculator
version=1.2.0
:annotations
classname=org.example.Calculator
:types
StatsResult={DDD[D average min max input}
:methods
add(DD)D=add(#am=handle;PDD#am=pre;*D)N
sub(DD)D=sub(#am=handle;PDD#am=pre;*D)N
stats([D)LStatsResult;=stats(#am=handle;P[D#am=out;**LStatsResult;)N
";

    #[test]
    fn test_parse_calculator() {
        let intf = InterfaceDescriptor::parse(CALCULATOR).unwrap();
        assert_eq!(intf.name(), "calculator");
        assert_eq!(intf.version(), &Version::new(1, 2, 0));
        assert_eq!(intf.header("type"), Some("interface"));
        assert_eq!(intf.annotation("classname"), Some("org.example.Calculator"));
        assert_eq!(intf.methods().len(), 3);

        let sub = intf.method("sub(DD)D").unwrap();
        assert_eq!(sub.index(), 1);
        assert_eq!(sub.name(), "sub");

        let stats = intf.method("stats([D)LStatsResult;").unwrap();
        assert_eq!(stats.index(), 2);
        let out = stats.result_argument().unwrap();
        assert_eq!(out.mode(), PassingMode::Output);
        assert_eq!(
            out.value_type().pointee(),
            intf.named_type("StatsResult")
        );
    }

    #[test]
    fn test_method_lookup_is_exact() {
        let intf = InterfaceDescriptor::parse(CALCULATOR).unwrap();
        assert!(intf.method("ADD(DD)D").is_none());
        assert!(intf.method("add(DD)").is_none());
        assert!(intf.method("missing()N").is_none());
    }

    #[test]
    fn test_header_is_required_first() {
        let err = InterfaceDescriptor::parse(":methods\nf()N=f()N\n").unwrap_err();
        assert!(err.to_string().contains(":header"));
    }

    #[test]
    fn test_sections_out_of_order() {
        let text = ":header\ntype=interface\nname=x\nversion=1.0.0\n:methods\n:types\n";
        assert!(InterfaceDescriptor::parse(text).is_err());
    }

    #[test]
    fn test_missing_header_keys() {
        assert!(InterfaceDescriptor::parse(":header\ntype=interface\nname=x\n").is_err());
        assert!(InterfaceDescriptor::parse(":header\ntype=message\nname=x\nversion=1.0.0\n").is_err());
        assert!(InterfaceDescriptor::parse(":header\ntype=interface\nname=x\nversion=one\n").is_err());
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let text = ":header\ntype=interface\nname=x\nversion=1.0.0\n:methods\nf()N=f()N\nf()N=g()N\n";
        let err = InterfaceDescriptor::parse(text).unwrap_err();
        assert!(matches!(err, DynRpcError::Descriptor { line: 7, .. }));
    }

    #[test]
    fn test_bad_method_reports_line() {
        let text = ":header\ntype=interface\nname=x\nversion=1.0.0\n:methods\nf()N=f(#am=pre;D)N\n";
        let err = InterfaceDescriptor::parse(text).unwrap_err();
        assert!(matches!(err, DynRpcError::Descriptor { line: 6, .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CALCULATOR.as_bytes()).unwrap();

        let intf = InterfaceDescriptor::load(file.path()).unwrap();
        assert_eq!(intf.methods().len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = InterfaceDescriptor::load("/nonexistent/calculator.descriptor").unwrap_err();
        assert!(matches!(err, DynRpcError::Io { path: Some(_), .. }));
    }
}
