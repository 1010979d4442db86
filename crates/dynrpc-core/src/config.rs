//! Centralized configuration for the marshaller.
//!
//! Wire field names and descriptor limits live here so the encoder, decoder
//! and dispatcher agree on them.

/// Wire envelope field names.
pub struct WireConfig;

impl WireConfig {
    /// Request: method signature.
    pub const METHOD_FIELD: &'static str = "m";
    /// Request: ordered STANDARD argument values.
    pub const ARGS_FIELD: &'static str = "a";
    /// Reply: result value of a successful call.
    pub const RESULT_FIELD: &'static str = "r";
    /// Reply: non-zero status returned by the native function.
    pub const ERROR_FIELD: &'static str = "e";
    /// Status returned by a native function that succeeded.
    pub const STATUS_OK: i32 = 0;
}

/// Interface descriptor parsing configuration.
pub struct DescriptorConfig;

impl DescriptorConfig {
    pub const HEADER_SECTION: &'static str = ":header";
    pub const ANNOTATIONS_SECTION: &'static str = ":annotations";
    pub const TYPES_SECTION: &'static str = ":types";
    pub const METHODS_SECTION: &'static str = ":methods";

    /// Value of the `type` header key for service interfaces.
    pub const INTERFACE_TYPE: &'static str = "interface";

    /// Meta property selecting an argument passing mode.
    pub const ARGUMENT_META_KEY: &'static str = "am";

    /// Largest descriptor document accepted by `InterfaceDescriptor::load`.
    pub const MAX_DESCRIPTOR_BYTES: u64 = 1_048_576; // 1MB

    /// Deepest type nesting accepted by the type parser.
    pub const MAX_TYPE_DEPTH: usize = 32;
}
