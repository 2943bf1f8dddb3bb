//! XML processing built on the quick-xml tokenizer.
//!
//! - `entities`: general entity declarations from the internal DTD subset
//!   and reference decoding
//! - `text`: character-data extraction as an iterator of trimmed fragments
//! - `dom`: document model and loader with optional entity expansion
//! - `writer`: document serialization

pub mod dom;
pub mod entities;
pub mod text;
pub mod writer;

pub use dom::{Document, DocumentLoader, EntityLoader};
pub use text::TextFragments;
pub use writer::save_xml;

/// Whether entity references are substituted while loading a document.
///
/// Only the exact query value `"true"` enables substitution; anything else,
/// including an absent parameter, leaves references untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityExpansion {
    /// Declared entity references stay in the tree as reference nodes.
    #[default]
    Disabled,
    /// References are replaced by their content; external entities are loaded.
    Enabled,
}

impl EntityExpansion {
    /// Map the `xxe` query flag to an expansion mode.
    pub fn from_flag(value: Option<&str>) -> Self {
        match value {
            Some("true") => EntityExpansion::Enabled,
            _ => EntityExpansion::Disabled,
        }
    }
}

/// Errors raised while tokenizing, loading or writing XML.
#[derive(Debug)]
pub enum XmlError {
    /// The tokenizer rejected the input
    Syntax { position: u64, message: String },
    /// Input contained no markup at all
    EmptyDocument,
    /// Document has no root element
    NoRootElement,
    /// A second element was found after the root element
    MultipleRoots(String),
    /// Non-whitespace character data outside the root element
    TextOutsideRoot,
    /// Input ended while an element was still open
    UnclosedElement(String),
    /// Input is not valid UTF-8
    InvalidUtf8,
    /// Malformed `&...;` reference
    InvalidReference(String),
    /// Reference to an entity that was never declared
    UndefinedEntity(String),
    /// Entity references itself, directly or indirectly
    EntityLoop(String),
    /// Expansion exceeded the nesting or size limits
    ExpansionLimit(String),
    /// External entity referenced from an attribute value
    ExternalEntityInAttribute(String),
    /// Loading an external entity failed
    EntityLoad { name: String, message: String },
    /// Malformed markup declaration in the DOCTYPE
    Dtd(String),
    /// Construct not allowed at its position
    Misplaced(&'static str),
    /// Serialization failure
    Write(String),
}

impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XmlError::Syntax { position, message } => {
                write!(f, "Syntax error at byte {}: {}", position, message)
            }
            XmlError::EmptyDocument => write!(f, "Document is empty"),
            XmlError::NoRootElement => write!(f, "Start tag expected, no root element"),
            XmlError::MultipleRoots(name) => {
                write!(f, "Extra content at the end of the document: <{}>", name)
            }
            XmlError::TextOutsideRoot => write!(f, "Character data outside the root element"),
            XmlError::UnclosedElement(name) => {
                write!(f, "Premature end of data in tag {}", name)
            }
            XmlError::InvalidUtf8 => write!(f, "Input is not proper UTF-8"),
            XmlError::InvalidReference(reference) => {
                write!(f, "Invalid reference: {}", reference)
            }
            XmlError::UndefinedEntity(name) => write!(f, "Entity '{}' not defined", name),
            XmlError::EntityLoop(name) => write!(f, "Detected an entity reference loop: {}", name),
            XmlError::ExpansionLimit(msg) => write!(f, "Entity expansion limit exceeded: {}", msg),
            XmlError::ExternalEntityInAttribute(name) => write!(
                f,
                "Attribute references external entity '{}'",
                name
            ),
            XmlError::EntityLoad { name, message } => {
                write!(f, "Failed to load external entity '{}': {}", name, message)
            }
            XmlError::Dtd(msg) => write!(f, "Malformed DOCTYPE: {}", msg),
            XmlError::Misplaced(what) => write!(f, "{} not allowed here", what),
            XmlError::Write(msg) => write!(f, "Failed to serialize document: {}", msg),
        }
    }
}

impl std::error::Error for XmlError {}

/// Decode a byte slice produced by the tokenizer.
pub(crate) fn utf8(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(|_| XmlError::InvalidUtf8)
}
