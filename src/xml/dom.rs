//! Document model and loader.
//!
//! The loader drives the quick-xml tokenizer and builds a tree. Entity
//! references are either kept as `EntityReference` nodes or, with
//! `EntityExpansion::Enabled`, replaced by the parsed replacement text.
//! External entities are obtained through an `EntityLoader`.

use super::entities::{
    references, EntityDecl, EntityTable, ExpansionGuard, ExternalRefs, Segment,
};
use super::text::trim_fragment;
use super::{utf8, EntityExpansion, XmlError};
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::error::Error;
use tracing::debug;

/// `<?xml version=".." encoding=".." standalone=".."?>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDeclaration {
    pub version: String,
    pub encoding: Option<String>,
    pub standalone: Option<String>,
}

/// A node of the document tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Raw content of `<!DOCTYPE ...>`
    DocumentType(String),
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    /// Raw content of `<?target data?>`
    ProcessingInstruction(String),
    /// Unexpanded `&name;`
    EntityReference(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

#[cfg(test)]
impl Element {
    /// Concatenated text and CDATA content of this element and its descendants.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }

    /// First child element with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|node| match node {
            Node::Element(element) if element.name == name => Some(element),
            _ => None,
        })
    }
}

#[cfg(test)]
fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) | Node::CData(text) => out.push_str(text),
            Node::Element(element) => collect_text(&element.children, out),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Vec<ValuePart>,
}

/// Part of an attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePart {
    Text(String),
    EntityReference(String),
}

/// A parsed XML document
#[derive(Debug, Clone)]
pub struct Document {
    pub declaration: Option<XmlDeclaration>,
    /// Top-level nodes in document order, including the root element
    pub children: Vec<Node>,
    /// Entities declared in the internal DTD subset
    pub entities: EntityTable,
}

impl Document {
    /// Parse without entity expansion.
    pub fn parse(input: &[u8]) -> Result<Self, XmlError> {
        DocumentLoader::new(EntityExpansion::Disabled, &mut NoExternalEntities).load(input)
    }

    /// The root element
    pub fn root(&self) -> Option<&Element> {
        self.children.iter().find_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }
}

/// Source of external entity content.
pub trait EntityLoader {
    /// Fetch the bytes behind an entity's system identifier.
    fn load(
        &mut self,
        system_id: &str,
        public_id: Option<&str>,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>;
}

/// Loader that refuses every external entity
pub struct NoExternalEntities;

impl EntityLoader for NoExternalEntities {
    fn load(
        &mut self,
        system_id: &str,
        _public_id: Option<&str>,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        Err(format!("loading '{}' is not permitted", system_id).into())
    }
}

/// In-memory loader keyed by system identifier
impl EntityLoader for HashMap<String, Vec<u8>> {
    fn load(
        &mut self,
        system_id: &str,
        _public_id: Option<&str>,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        self.get(system_id)
            .cloned()
            .ok_or_else(|| format!("no such resource '{}'", system_id).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Document,
    Entity,
}

/// Builds a `Document` from bytes. Used once per document.
pub struct DocumentLoader<'l> {
    expansion: EntityExpansion,
    loader: &'l mut dyn EntityLoader,
    entities: EntityTable,
    guard: ExpansionGuard,
    declaration: Option<XmlDeclaration>,
}

impl<'l> DocumentLoader<'l> {
    pub fn new(expansion: EntityExpansion, loader: &'l mut dyn EntityLoader) -> Self {
        DocumentLoader {
            expansion,
            loader,
            entities: EntityTable::default(),
            guard: ExpansionGuard::new(),
            declaration: None,
        }
    }

    pub fn load(mut self, input: &[u8]) -> Result<Document, XmlError> {
        let children = self.build(input, Context::Document)?;

        if !children.iter().any(|node| matches!(node, Node::Element(_))) {
            let blank = utf8(input).map(|s| trim_fragment(s).is_empty()).unwrap_or(false);
            return Err(if blank {
                XmlError::EmptyDocument
            } else {
                XmlError::NoRootElement
            });
        }

        Ok(Document {
            declaration: self.declaration,
            children,
            entities: self.entities,
        })
    }

    fn build(&mut self, input: &[u8], context: Context) -> Result<Vec<Node>, XmlError> {
        let mut reader = Reader::from_reader(input);
        let mut top: Vec<Node> = Vec::new();
        let mut open: Vec<Element> = Vec::new();
        let mut seen_root = false;
        let mut first = true;

        loop {
            let position = reader.buffer_position() as u64;
            let event = reader
                .read_event()
                .map_err(|e| syntax_at(position, e))?;
            let at_start = std::mem::replace(&mut first, false);
            let in_prolog = open.is_empty() && context == Context::Document;

            match event {
                Event::Decl(decl) => {
                    if !at_start {
                        return Err(XmlError::Misplaced("XML declaration"));
                    }
                    // The text declaration of an external entity is dropped
                    if context == Context::Document {
                        self.declaration = Some(declaration(&decl, position)?);
                    }
                }
                Event::DocType(doctype) => {
                    if context != Context::Document || seen_root {
                        return Err(XmlError::Misplaced("DOCTYPE"));
                    }
                    let raw = utf8(&doctype)?.to_string();
                    self.entities = EntityTable::from_doctype(&raw)?;
                    if !self.entities.is_empty() {
                        debug!(entities = self.entities.len(), "Captured entity declarations");
                    }
                    for (name, decl) in self.entities.parameters() {
                        if let EntityDecl::External { system_id, .. } = decl {
                            debug!(entity = name, system_id = %system_id, "Parameter entity not loaded");
                        }
                    }
                    top.push(Node::DocumentType(raw));
                }
                Event::Start(start) => {
                    let element = self.element(&start, position)?;
                    if in_prolog {
                        check_root(&mut seen_root, &element)?;
                    }
                    open.push(element);
                }
                Event::Empty(start) => {
                    let element = self.element(&start, position)?;
                    if in_prolog {
                        check_root(&mut seen_root, &element)?;
                    }
                    append(&mut open, &mut top, Node::Element(element));
                }
                Event::End(_) => {
                    let element = open.pop().ok_or(XmlError::Misplaced("End tag"))?;
                    append(&mut open, &mut top, Node::Element(element));
                }
                Event::Text(text) => {
                    let raw = utf8(&text)?;
                    if in_prolog {
                        if !trim_fragment(raw).is_empty() {
                            return Err(XmlError::TextOutsideRoot);
                        }
                        continue;
                    }
                    for node in self.character_data(raw)? {
                        append(&mut open, &mut top, node);
                    }
                }
                Event::CData(cdata) => {
                    if in_prolog {
                        return Err(XmlError::TextOutsideRoot);
                    }
                    append(&mut open, &mut top, Node::CData(utf8(&cdata)?.to_string()));
                }
                Event::Comment(comment) => {
                    append(&mut open, &mut top, Node::Comment(utf8(&comment)?.to_string()));
                }
                Event::PI(pi) => {
                    append(
                        &mut open,
                        &mut top,
                        Node::ProcessingInstruction(utf8(&pi)?.to_string()),
                    );
                }
                Event::Eof => break,
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }

        if let Some(element) = open.pop() {
            return Err(XmlError::UnclosedElement(element.name));
        }
        Ok(top)
    }

    fn element(&mut self, start: &BytesStart<'_>, position: u64) -> Result<Element, XmlError> {
        let name = utf8(start.name().as_ref())?.to_string();
        let mut attributes = Vec::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| syntax_at(position, e))?;
            let attr_name = utf8(attr.key.as_ref())?.to_string();
            let value = self.attribute_value(utf8(&attr.value)?)?;
            attributes.push(Attribute {
                name: attr_name,
                value,
            });
        }

        Ok(Element {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    fn attribute_value(&mut self, raw: &str) -> Result<Vec<ValuePart>, XmlError> {
        let mut parts = Vec::new();

        for segment in references(raw)? {
            match segment {
                Segment::Text(text) => push_value_text(&mut parts, &normalize_attribute(text)),
                Segment::Char(c) => push_value_text(&mut parts, c.encode_utf8(&mut [0; 4])),
                Segment::Entity(name) => match self.entities.get(name) {
                    None => return Err(XmlError::UndefinedEntity(name.to_string())),
                    Some(EntityDecl::External { .. }) => {
                        return Err(XmlError::ExternalEntityInAttribute(name.to_string()))
                    }
                    Some(EntityDecl::Internal(_)) => match self.expansion {
                        EntityExpansion::Disabled => {
                            parts.push(ValuePart::EntityReference(name.to_string()))
                        }
                        EntityExpansion::Enabled => {
                            let text = self.entities.expand_text(
                                &format!("&{};", name),
                                ExternalRefs::Reject,
                                &mut self.guard,
                            )?;
                            push_value_text(&mut parts, &text);
                        }
                    },
                },
            }
        }

        Ok(parts)
    }

    fn character_data(&mut self, raw: &str) -> Result<Vec<Node>, XmlError> {
        let mut nodes = Vec::new();

        for segment in references(raw)? {
            match segment {
                Segment::Text(text) => push_node(&mut nodes, Node::Text(normalize_newlines(text))),
                Segment::Char(c) => push_node(&mut nodes, Node::Text(c.to_string())),
                Segment::Entity(name) => {
                    let decl = self
                        .entities
                        .get(name)
                        .cloned()
                        .ok_or_else(|| XmlError::UndefinedEntity(name.to_string()))?;
                    match self.expansion {
                        EntityExpansion::Disabled => {
                            nodes.push(Node::EntityReference(name.to_string()))
                        }
                        EntityExpansion::Enabled => {
                            for node in self.expand(name, decl)? {
                                push_node(&mut nodes, node);
                            }
                        }
                    }
                }
            }
        }

        Ok(nodes)
    }

    /// Parse an entity's replacement text in place of its reference.
    fn expand(&mut self, name: &str, decl: EntityDecl) -> Result<Vec<Node>, XmlError> {
        self.guard.enter(name)?;

        let replacement = match decl {
            EntityDecl::Internal(value) => value.into_bytes(),
            EntityDecl::External {
                public_id,
                system_id,
            } => {
                debug!(entity = name, system_id = %system_id, "Loading external entity");
                self.loader
                    .load(&system_id, public_id.as_deref())
                    .map_err(|e| XmlError::EntityLoad {
                        name: name.to_string(),
                        message: e.to_string(),
                    })?
            }
        };

        self.guard.account(replacement.len())?;
        let nodes = self.build(&replacement, Context::Entity)?;
        self.guard.leave();
        Ok(nodes)
    }
}

fn check_root(seen_root: &mut bool, element: &Element) -> Result<(), XmlError> {
    if *seen_root {
        return Err(XmlError::MultipleRoots(element.name.clone()));
    }
    *seen_root = true;
    Ok(())
}

fn declaration(decl: &BytesDecl<'_>, position: u64) -> Result<XmlDeclaration, XmlError> {
    let version = decl.version().map_err(|e| syntax_at(position, e))?;
    let encoding = decl
        .encoding()
        .transpose()
        .map_err(|e| syntax_at(position, e))?;
    let standalone = decl
        .standalone()
        .transpose()
        .map_err(|e| syntax_at(position, e))?;

    Ok(XmlDeclaration {
        version: utf8(&version)?.to_string(),
        encoding: encoding.map(|e| utf8(&e).map(str::to_string)).transpose()?,
        standalone: standalone.map(|s| utf8(&s).map(str::to_string)).transpose()?,
    })
}

fn syntax_at(position: u64, error: impl std::fmt::Display) -> XmlError {
    XmlError::Syntax {
        position,
        message: error.to_string(),
    }
}

/// Attach a finished node to the innermost open element, or to the top level.
fn append(open: &mut [Element], top: &mut Vec<Node>, node: Node) {
    match open.last_mut() {
        Some(parent) => push_node(&mut parent.children, node),
        None => push_node(top, node),
    }
}

/// Push a node, merging adjacent text.
fn push_node(nodes: &mut Vec<Node>, node: Node) {
    if let Node::Text(text) = &node {
        if let Some(Node::Text(last)) = nodes.last_mut() {
            last.push_str(text);
            return;
        }
    }
    nodes.push(node);
}

fn push_value_text(parts: &mut Vec<ValuePart>, text: &str) {
    if let Some(ValuePart::Text(last)) = parts.last_mut() {
        last.push_str(text);
        return;
    }
    parts.push(ValuePart::Text(text.to_string()));
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn normalize_attribute(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const XXE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE data [
  <!ENTITY xxe SYSTEM "file:///secret.txt">
]>
<data>&xxe;</data>"#;

    fn loader(entries: &[(&str, &str)]) -> HashMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_parse_tree() {
        let doc = Document::parse(br#"<a x="1"><b>hello</b><!-- note --><c/></a>"#).unwrap();
        let root = doc.root().unwrap();

        assert_eq!(root.name, "a");
        assert_eq!(
            root.attributes,
            vec![Attribute {
                name: "x".to_string(),
                value: vec![ValuePart::Text("1".to_string())],
            }]
        );
        assert_eq!(root.children.len(), 3);
        assert_eq!(root.child("b").unwrap().text_content(), "hello");
        assert_eq!(root.children[1], Node::Comment(" note ".to_string()));
        assert!(root.child("c").unwrap().children.is_empty());
    }

    #[test]
    fn test_declaration_and_doctype_retained() {
        let doc = Document::parse(XXE.as_bytes()).unwrap();

        assert_eq!(
            doc.declaration,
            Some(XmlDeclaration {
                version: "1.0".to_string(),
                encoding: Some("UTF-8".to_string()),
                standalone: None,
            })
        );
        assert!(matches!(&doc.children[0], Node::DocumentType(raw) if raw.contains("<!ENTITY xxe")));
        assert_eq!(doc.entities.len(), 1);
    }

    #[test]
    fn test_references_kept_when_disabled() {
        let mut files = loader(&[("file:///secret.txt", "TOP SECRET")]);
        let doc = DocumentLoader::new(EntityExpansion::Disabled, &mut files)
            .load(XXE.as_bytes())
            .unwrap();

        let root = doc.root().unwrap();
        assert_eq!(root.children, vec![Node::EntityReference("xxe".to_string())]);
        assert_eq!(root.text_content(), "");
    }

    #[test]
    fn test_external_entity_expanded_when_enabled() {
        let mut files = loader(&[("file:///secret.txt", "TOP SECRET")]);
        let doc = DocumentLoader::new(EntityExpansion::Enabled, &mut files)
            .load(XXE.as_bytes())
            .unwrap();

        assert_eq!(doc.root().unwrap().text_content(), "TOP SECRET");
    }

    #[test]
    fn test_external_markup_is_parsed() {
        let mut files = loader(&[(
            "part.xml",
            "<?xml version=\"1.0\"?><item id=\"7\">seven</item>",
        )]);
        let input = r#"<!DOCTYPE list [<!ENTITY part SYSTEM "part.xml">]><list>&part;</list>"#;
        let doc = DocumentLoader::new(EntityExpansion::Enabled, &mut files)
            .load(input.as_bytes())
            .unwrap();

        let item = doc.root().unwrap().child("item").unwrap();
        assert_eq!(item.text_content(), "seven");
    }

    #[test]
    fn test_internal_entity_text_merges() {
        let input = r#"<!DOCTYPE a [<!ENTITY who "world">]><a>hello &who;!</a>"#;
        let mut none = NoExternalEntities;
        let doc = DocumentLoader::new(EntityExpansion::Enabled, &mut none)
            .load(input.as_bytes())
            .unwrap();

        assert_eq!(
            doc.root().unwrap().children,
            vec![Node::Text("hello world!".to_string())]
        );
    }

    #[test]
    fn test_attribute_entities() {
        let input = r#"<!DOCTYPE a [<!ENTITY v "val">]><a k="x&v;y"/>"#;

        let doc = Document::parse(input.as_bytes()).unwrap();
        assert_eq!(
            doc.root().unwrap().attributes[0].value,
            vec![
                ValuePart::Text("x".to_string()),
                ValuePart::EntityReference("v".to_string()),
                ValuePart::Text("y".to_string()),
            ]
        );

        let mut none = NoExternalEntities;
        let doc = DocumentLoader::new(EntityExpansion::Enabled, &mut none)
            .load(input.as_bytes())
            .unwrap();
        assert_eq!(
            doc.root().unwrap().attributes[0].value,
            vec![ValuePart::Text("xvaly".to_string())]
        );
    }

    #[test]
    fn test_external_entity_in_attribute_rejected() {
        let input = r#"<!DOCTYPE a [<!ENTITY x SYSTEM "file:///etc/passwd">]><a k="&x;"/>"#;
        assert!(matches!(
            Document::parse(input.as_bytes()),
            Err(XmlError::ExternalEntityInAttribute(_))
        ));
    }

    #[test]
    fn test_load_failure_surfaces() {
        let mut none = NoExternalEntities;
        let result = DocumentLoader::new(EntityExpansion::Enabled, &mut none).load(XXE.as_bytes());
        assert!(matches!(result, Err(XmlError::EntityLoad { name, .. }) if name == "xxe"));
    }

    #[test]
    fn test_undefined_entity() {
        assert!(matches!(
            Document::parse(b"<a>&nope;</a>"),
            Err(XmlError::UndefinedEntity(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_recursive_entity() {
        let input = r#"<!DOCTYPE a [<!ENTITY e "x&e;">]><a>&e;</a>"#;
        let mut none = NoExternalEntities;
        let result = DocumentLoader::new(EntityExpansion::Enabled, &mut none).load(input.as_bytes());
        assert!(matches!(result, Err(XmlError::EntityLoop(_))));
    }

    #[test]
    fn test_document_shape_errors() {
        assert!(matches!(Document::parse(b""), Err(XmlError::EmptyDocument)));
        assert!(matches!(Document::parse(b"  \n"), Err(XmlError::EmptyDocument)));
        assert!(matches!(
            Document::parse(b"<!-- only a comment -->"),
            Err(XmlError::NoRootElement)
        ));
        assert!(matches!(
            Document::parse(b"<a/><b/>"),
            Err(XmlError::MultipleRoots(name)) if name == "b"
        ));
        assert!(matches!(
            Document::parse(b"<a/>trailing"),
            Err(XmlError::TextOutsideRoot)
        ));
        assert!(Document::parse(b"<a><b></a>").is_err());
        assert!(Document::parse(b"<a>").is_err());
    }

    #[test]
    fn test_newline_normalization() {
        let doc = Document::parse(b"<a>one\r\ntwo\rthree</a>").unwrap();
        assert_eq!(doc.root().unwrap().text_content(), "one\ntwo\nthree");
    }
}
