//! The two XML targets and the response-body layout they share.
//!
//! Every body starts with the content being parsed, a newline and the
//! separator line; whatever the parser produced follows.

pub mod raw_input;
pub mod url_or_body;

use crate::fetch::Fetcher;
use bytes::{Bytes, BytesMut};

/// Line between the echoed input and the parser output
pub const SEPARATOR: &str =
    "----------------------------------------------------------------------------";

/// Shared state handed to the targets
#[derive(Debug, Clone)]
pub struct TargetContext {
    pub fetcher: Fetcher,
    pub inline_warnings: bool,
}

/// Response body under construction
pub struct Transcript {
    body: BytesMut,
    inline_warnings: bool,
}

impl Transcript {
    pub fn new(inline_warnings: bool) -> Self {
        Transcript {
            body: BytesMut::new(),
            inline_warnings,
        }
    }

    /// Append the input verbatim, then the separator line.
    pub fn echo(&mut self, content: &[u8]) {
        self.body.reserve(content.len() + SEPARATOR.len() + 2);
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\n");
        self.body.extend_from_slice(SEPARATOR.as_bytes());
        self.body.extend_from_slice(b"\n");
    }

    /// Append one output line.
    pub fn line(&mut self, text: &str) {
        self.body.extend_from_slice(text.as_bytes());
        self.body.extend_from_slice(b"\n");
    }

    /// Append raw bytes as produced.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Append a `Warning:` line, unless inline warnings are off.
    pub fn warning(&mut self, message: impl std::fmt::Display) {
        if self.inline_warnings {
            self.line(&format!("Warning: {}", message));
        }
    }

    pub fn finish(self) -> Bytes {
        self.body.freeze()
    }
}
