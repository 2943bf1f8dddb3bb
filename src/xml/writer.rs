//! Document serialization.
//!
//! Output layout: XML declaration, newline, then every top-level node
//! followed by a newline. Childless elements are written as `<name/>`.

use super::dom::{Attribute, Document, Element, Node, ValuePart};
use super::XmlError;
use quick_xml::escape::partial_escape;
use quick_xml::events::attributes::Attribute as RawAttribute;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::Writer;
use std::borrow::Cow;

/// Serialize a document to bytes.
pub fn save_xml(document: &Document) -> Result<Vec<u8>, XmlError> {
    let mut writer = Writer::new(Vec::new());

    let (version, encoding, standalone) = match &document.declaration {
        Some(decl) => (
            decl.version.as_str(),
            decl.encoding.as_deref(),
            decl.standalone.as_deref(),
        ),
        None => ("1.0", None, None),
    };
    write(&mut writer, Event::Decl(BytesDecl::new(version, encoding, standalone)))?;
    newline(&mut writer)?;

    for node in &document.children {
        write_node(&mut writer, node)?;
        newline(&mut writer)?;
    }

    Ok(writer.into_inner())
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<(), XmlError> {
    match node {
        Node::DocumentType(raw) => write(writer, Event::DocType(BytesText::from_escaped(raw.as_str()))),
        Node::Element(element) => write_element(writer, element),
        Node::Text(text) => write(
            writer,
            Event::Text(BytesText::from_escaped(escape_text(text))),
        ),
        Node::CData(text) => write(writer, Event::CData(BytesCData::new(text.as_str()))),
        Node::Comment(text) => write(writer, Event::Comment(BytesText::from_escaped(text.as_str()))),
        Node::ProcessingInstruction(content) => {
            write(writer, Event::PI(BytesPI::new(content.as_str())))
        }
        Node::EntityReference(name) => write(
            writer,
            Event::Text(BytesText::from_escaped(format!("&{};", name))),
        ),
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), XmlError> {
    let mut start = BytesStart::new(element.name.as_str());
    for attribute in &element.attributes {
        start.push_attribute(RawAttribute {
            key: QName(attribute.name.as_bytes()),
            value: Cow::Owned(attribute_value(attribute).into_bytes()),
        });
    }

    if element.children.is_empty() {
        return write(writer, Event::Empty(start));
    }

    write(writer, Event::Start(start))?;
    for child in &element.children {
        write_node(writer, child)?;
    }
    write(writer, Event::End(BytesEnd::new(element.name.as_str())))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), XmlError> {
    writer
        .write_event(event)
        .map_err(|e| XmlError::Write(e.to_string()))
}

fn newline(writer: &mut Writer<Vec<u8>>) -> Result<(), XmlError> {
    write(writer, Event::Text(BytesText::from_escaped("\n")))
}

fn escape_text(text: &str) -> String {
    partial_escape(text).replace('\r', "&#13;")
}

/// Escaped attribute value, with unexpanded references written back as `&name;`.
fn attribute_value(attribute: &Attribute) -> String {
    let mut out = String::new();
    for part in &attribute.value {
        match part {
            ValuePart::Text(text) => {
                for c in text.chars() {
                    match c {
                        '&' => out.push_str("&amp;"),
                        '<' => out.push_str("&lt;"),
                        '>' => out.push_str("&gt;"),
                        '"' => out.push_str("&quot;"),
                        '\n' => out.push_str("&#10;"),
                        '\r' => out.push_str("&#13;"),
                        '\t' => out.push_str("&#9;"),
                        c => out.push(c),
                    }
                }
            }
            ValuePart::EntityReference(name) => {
                out.push('&');
                out.push_str(name);
                out.push(';');
            }
        }
    }
    out
}
