mod did;
mod handle;

pub use did::{Did, DID_REGEX};
pub use handle::{Handle, HANDLE_REGEX};

use smol_str::SmolStr;

/// Error returned when a string fails `Did` or `Handle` validation.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
#[error("invalid {kind}: {value:?}")]
#[diagnostic(
    code(heddle_common::ident),
    help("handles look like `alice.example.com`; DIDs look like `did:plc:abc123`")
)]
pub struct IdentParseError {
    kind: &'static str,
    value: SmolStr,
}

impl IdentParseError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: SmolStr::new(value),
        }
    }

    /// Which identifier kind failed to parse: `"did"` or `"handle"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The rejected input.
    pub fn value(&self) -> &str {
        &self.value
    }
}
