//! Subcommand implementations.

#![allow(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use dynrpc_core::rpc::{client, dispatch};
use dynrpc_core::{codec, InterfaceDescriptor, NativeValue, PassingMode, ServiceTable};
use serde_json::Value;
use std::ffi::c_void;
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Render the header and methods of a descriptor file.
pub fn inspect(path: &Path) -> Result<String> {
    let interface = InterfaceDescriptor::load(path)
        .with_context(|| format!("Failed to load descriptor {}", path.display()))?;

    let mut out = String::new();
    writeln!(out, "{} {}", interface.name(), interface.version())?;
    for (key, value) in interface.annotations() {
        writeln!(out, "  @{}={}", key, value)?;
    }
    for method in interface.methods() {
        writeln!(out, "[{}] {} -> {}", method.index(), method.signature(), method.return_type())?;
        for arg in method.arguments() {
            writeln!(out, "    {:>2}: {:<8} {}", arg.index(), arg.mode().as_str(), arg.ty())?;
        }
    }
    Ok(out)
}

/// Build the request envelope for `signature` from JSON argument values.
///
/// The values are first turned into native instances, exactly as a local
/// proxy would hold them, and then handed to the client encoder.
pub fn encode(path: &Path, signature: &str, args: &str) -> Result<String> {
    let interface = InterfaceDescriptor::load(path)
        .with_context(|| format!("Failed to load descriptor {}", path.display()))?;
    let method = interface
        .method(signature)
        .ok_or_else(|| anyhow!("No method with signature '{}' in {}", signature, interface.name()))?;

    let values: Vec<Value> =
        serde_json::from_str(args).context("Arguments must be a JSON array")?;
    if values.len() != method.wire_argument_count() {
        bail!(
            "'{}' takes {} wire arguments, got {}",
            signature,
            method.wire_argument_count(),
            values.len()
        );
    }

    let mut values = values.iter();
    let mut natives: Vec<Option<NativeValue<'_>>> = Vec::with_capacity(method.arguments().len());
    for arg in method.arguments() {
        let native = match arg.mode() {
            PassingMode::Standard => match values.next() {
                Some(value) => Some(
                    codec::deserialize(arg.ty(), value)
                        .with_context(|| format!("Argument {} of '{}'", arg.index(), signature))?,
                ),
                None => None,
            },
            PassingMode::PreAllocatedOutput | PassingMode::Output | PassingMode::Handle => None,
        };
        natives.push(native);
    }
    let pointers: Vec<*mut c_void> = natives
        .iter()
        .map(|n| n.as_ref().map_or(std::ptr::null_mut(), |v| v.as_ptr().cast()))
        .collect();

    // SAFETY: every STANDARD entry points at a live NativeValue of its type;
    // the other entries are not read.
    let request = unsafe { client::prepare_invoke_request(method, &pointers) }?;
    Ok(request)
}

/// Outcome counters of a serve session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub replies: usize,
    pub failures: usize,
}

/// Dispatch each non-empty input line as a request and write one line back:
/// the reply text, or `error: <message>` for a local failure.
pub fn serve(
    interface: &InterfaceDescriptor,
    service: &ServiceTable,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<ServeSummary> {
    info!(
        "Serving {} {} ({} methods)",
        interface.name(),
        interface.version(),
        interface.methods().len()
    );
    let mut summary = ServeSummary::default();
    for line in input.lines() {
        let line = line.context("Failed to read request")?;
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        match dispatch::call(interface, service, request) {
            Ok(reply) => {
                debug!("Reply: {}", reply);
                summary.replies += 1;
                writeln!(output, "{}", reply)?;
            }
            Err(e) => {
                warn!("Request failed ({:?}): {}", e.kind(), e);
                summary.failures += 1;
                writeln!(output, "error: {}", e)?;
            }
        }
        output.flush()?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn write_demo_descriptor() -> (TempDir, std::path::PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("calculator.descriptor");
        std::fs::write(&path, demo::DESCRIPTOR).unwrap();
        (temp_dir, path)
    }

    #[test]
    fn test_inspect_lists_methods_and_modes() {
        let (_dir, path) = write_demo_descriptor();
        let text = inspect(&path).unwrap();
        assert!(text.starts_with("calculator 1.0.0\n"));
        assert!(text.contains("@classname=org.example.Calculator"));
        assert!(text.contains("[3] stats([D)LStatsResult; -> N"));
        assert!(text.contains("out"));
        assert!(text.contains("handle"));
    }

    #[test]
    fn test_inspect_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(inspect(&temp_dir.path().join("absent.descriptor")).is_err());
    }

    #[test]
    fn test_encode_add() {
        let (_dir, path) = write_demo_descriptor();
        let request = encode(&path, "add(DD)D", "[2, 3.5]").unwrap();
        assert_eq!(request, r#"{"m":"add(DD)D","a":[2.0,3.5]}"#);
    }

    #[test]
    fn test_encode_sequence() {
        let (_dir, path) = write_demo_descriptor();
        let request = encode(&path, "stats([D)LStatsResult;", "[[1, 2]]").unwrap();
        assert_eq!(request, r#"{"m":"stats([D)LStatsResult;","a":[[1.0,2.0]]}"#);
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        let (_dir, path) = write_demo_descriptor();
        assert!(encode(&path, "mul(DD)D", "[1, 2]").is_err());
        assert!(encode(&path, "add(DD)D", "[1]").is_err());
        assert!(encode(&path, "add(DD)D", "[1, \"two\"]").is_err());
        assert!(encode(&path, "add(DD)D", "{}").is_err());
    }

    #[test]
    fn test_serve_demo_session() {
        let interface = demo::interface().unwrap();
        let service = demo::service();
        let input = Cursor::new(
            [
                r#"{"m":"add(DD)D","a":[2.0,3.0]}"#,
                "",
                r#"{"m":"sqrt(D)D","a":[-1.0]}"#,
                r#"{"m":"missing()N","a":[]}"#,
                r#"{"m":"stats([D)LStatsResult;","a":[[1.0,3.0]]}"#,
            ]
            .join("\n"),
        );
        let mut output = Vec::new();

        let summary = serve(&interface, &service, input, &mut output).unwrap();
        assert_eq!(summary, ServeSummary { replies: 3, failures: 1 });

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], r#"{"r":5.0}"#);
        assert_eq!(lines[1], r#"{"e":1}"#);
        assert!(lines[2].starts_with("error: Cannot find method"));
        let stats: Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(stats["r"]["average"], 2.0);
        assert_eq!(stats["r"]["max"], 3.0);
    }
}
