//! Character-data extraction.
//!
//! `TextFragments` walks the tokenizer's events and yields character data
//! the way a SAX `characters` callback sees it: every literal run, every
//! character or predefined-entity reference, every internal entity
//! expansion and every CDATA section is its own fragment. Fragments are
//! trimmed and blank ones skipped. Element and attribute structure is
//! otherwise ignored.

use super::entities::{references, EntityDecl, EntityTable, ExpansionGuard, ExternalRefs, Segment};
use super::{utf8, XmlError};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::VecDeque;

/// Iterator over the non-blank character data of a document, in document order.
///
/// Iteration ends with `Some(Err(_))` on the first well-formedness error;
/// fragments yielded before that point stay valid.
pub struct TextFragments<'a> {
    reader: Reader<&'a [u8]>,
    entities: EntityTable,
    guard: ExpansionGuard,
    open: Vec<String>,
    pending: VecDeque<String>,
    error: Option<XmlError>,
    seen_root: bool,
    finished: bool,
}

impl<'a> TextFragments<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        TextFragments {
            reader: Reader::from_reader(input),
            entities: EntityTable::default(),
            guard: ExpansionGuard::new(),
            open: Vec::new(),
            pending: VecDeque::new(),
            error: None,
            seen_root: false,
            finished: false,
        }
    }

    fn syntax(&self, message: impl std::fmt::Display) -> XmlError {
        XmlError::Syntax {
            position: self.reader.buffer_position() as u64,
            message: message.to_string(),
        }
    }

    /// Handle one event, queueing any character data it carries.
    fn step(&mut self, event: Event<'a>) -> Result<(), XmlError> {
        match event {
            Event::Start(start) => {
                let name = self.open_element(start.name().as_ref())?;
                self.open.push(name);
            }
            Event::Empty(start) => {
                self.open_element(start.name().as_ref())?;
            }
            Event::End(_) => {
                self.open.pop();
            }
            Event::Text(text) => {
                let raw = utf8(&text)?;
                if self.open.is_empty() {
                    return outside_root(raw);
                }
                self.character_data(raw)?;
            }
            Event::CData(cdata) => {
                if self.open.is_empty() {
                    return Err(XmlError::TextOutsideRoot);
                }
                self.pending.push_back(utf8(&cdata)?.to_string());
            }
            Event::DocType(doctype) => {
                if self.seen_root {
                    return Err(XmlError::Misplaced("DOCTYPE"));
                }
                self.entities = EntityTable::from_doctype(utf8(&doctype)?)?;
            }
            Event::Eof => {
                self.finished = true;
                if !self.seen_root {
                    return Err(XmlError::NoRootElement);
                }
                if let Some(name) = self.open.pop() {
                    return Err(XmlError::UnclosedElement(name));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Queue one fragment per literal run, reference and internal expansion.
    /// Fragments before a bad reference stay queued.
    fn character_data(&mut self, raw: &str) -> Result<(), XmlError> {
        for segment in references(raw)? {
            match segment {
                Segment::Text(text) => self.pending.push_back(text.to_string()),
                Segment::Char(c) => self.pending.push_back(c.to_string()),
                Segment::Entity(name) => match self.entities.get(name) {
                    None => return Err(XmlError::UndefinedEntity(name.to_string())),
                    Some(EntityDecl::External { .. }) => {}
                    Some(EntityDecl::Internal(_)) => {
                        let expanded = self.entities.expand_text(
                            &format!("&{};", name),
                            ExternalRefs::Skip,
                            &mut self.guard,
                        )?;
                        self.pending.push_back(expanded);
                    }
                },
            }
        }
        Ok(())
    }

    fn open_element(&mut self, name: &[u8]) -> Result<String, XmlError> {
        let name = utf8(name)?.to_string();
        if self.open.is_empty() {
            if self.seen_root {
                return Err(XmlError::MultipleRoots(name));
            }
            self.seen_root = true;
        }
        Ok(name)
    }
}

/// Only whitespace may appear outside the root element.
fn outside_root(raw: &str) -> Result<(), XmlError> {
    if trim_fragment(raw).is_empty() {
        Ok(())
    } else {
        Err(XmlError::TextOutsideRoot)
    }
}

impl Iterator for TextFragments<'_> {
    type Item = Result<String, XmlError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(fragment) = self.pending.pop_front() {
                let trimmed = trim_fragment(&fragment);
                if !trimmed.is_empty() {
                    return Some(Ok(trimmed.to_string()));
                }
            }
            if self.finished {
                return self.error.take().map(Err);
            }

            let result = match self.reader.read_event() {
                Ok(event) => self.step(event),
                Err(e) => Err(self.syntax(e)),
            };
            if let Err(e) = result {
                self.finished = true;
                self.error = Some(e);
            }
        }
    }
}

/// Strip the whitespace set `" \t\n\r\0\x0B"` from both ends.
pub fn trim_fragment(fragment: &str) -> &str {
    fragment.trim_matches([' ', '\t', '\n', '\r', '\0', '\x0B'])
}
