//! XML rewriting over a minimal element tree.

use std::sync::OnceLock;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use serde_json::Value;

use crate::lookup::resolve_config_references;
use crate::{ParserError, Replacement, Result};

/// `[attr='value']` — either as a suffix on the final path segment, or as
/// the whole replacement value.
fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[(\w+)='(.*)'\]$").expect("xml attr regex"))
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child_mut(&mut self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.name == name)
    }

    fn ensure_child(&mut self, name: &str) -> &mut Node {
        if let Some(i) = self.child_mut(name) {
            return &mut self.children[i];
        }
        self.children.push(Node {
            name: name.to_string(),
            ..Default::default()
        });
        self.children.last_mut().expect("just pushed")
    }

    fn set_attr(&mut self, name: &str, value: String) {
        if let Some(attr) = self.attrs.iter_mut().find(|(n, _)| n == name) {
            attr.1 = value;
        } else {
            self.attrs.push((name.to_string(), value));
        }
    }
}

pub(crate) fn rewrite_xml(
    contents: &[u8],
    replacements: &[Replacement],
    config: &Value,
) -> Result<Vec<u8>> {
    let mut root = parse(contents)?;

    for replacement in replacements {
        let rendered = resolve_config_references(&replacement.replace_with, config);
        apply(&mut root, &replacement.matches, &rendered);
    }

    serialize(&root)
}

fn apply(root: &mut Node, path: &str, rendered: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last_raw, parents)) = segments.split_last() else {
        return;
    };

    // `Root.Prop[attr='v']` targets the attribute rather than the text.
    let (last, attr_target) = match last_raw.find('[') {
        Some(at) if attr_regex().is_match(&last_raw[at..]) => {
            let caps = attr_regex()
                .captures(&last_raw[at..])
                .expect("checked above");
            (
                &last_raw[..at],
                Some(caps.get(1).expect("attr name").as_str().to_string()),
            )
        }
        _ => (*last_raw, None),
    };

    let mut current = root;
    for segment in parents {
        current = current.ensure_child(segment);
    }
    let target = current.ensure_child(last);

    if let Some(attr) = attr_target {
        target.set_attr(&attr, rendered.to_string());
        return;
    }

    // A replacement value of the `[attr='v']` shape assigns an attribute
    // instead of the element text.
    if let Some(caps) = attr_regex().captures(rendered) {
        let name = caps.get(1).expect("attr name").as_str().to_string();
        let value = caps.get(2).expect("attr value").as_str().to_string();
        target.set_attr(&name, value);
        return;
    }

    target.text = rendered.to_string();
}

fn parse(contents: &[u8]) -> Result<Node> {
    let mut reader = Reader::from_reader(contents);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = vec![Node::default()];
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| ParserError::invalid("xml", e))?
        {
            Event::Start(start) => {
                stack.push(node_from_start(&start)?);
            }
            Event::Empty(start) => {
                let node = node_from_start(&start)?;
                stack.last_mut().expect("document node").children.push(node);
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| ParserError::invalid("xml", e))?;
                stack.last_mut().expect("document node").text.push_str(&text);
            }
            Event::End(_) => {
                let node = stack.pop().expect("balanced document");
                stack.last_mut().expect("document node").children.push(node);
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and CDATA are
            // dropped; egg-managed XML files do not rely on them.
            _ => {}
        }
        buf.clear();
    }

    let mut document = stack.pop().expect("document node");
    if document.children.len() == 1 && document.name.is_empty() {
        Ok(document.children.remove(0))
    } else {
        Ok(document)
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<Node> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParserError::invalid("xml", e))?;
        attrs.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        ));
    }
    Ok(Node {
        name,
        attrs,
        ..Default::default()
    })
}

fn serialize(root: &Node) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write_node(&mut writer, root).map_err(|e| ParserError::invalid("xml", e))?;
    let mut out = writer.into_inner();
    out.push(b'\n');
    Ok(out)
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> quick_xml::Result<()> {
    let mut start = BytesStart::new(&node.name);
    for (name, value) in &node.attrs {
        start.push_attribute((name.as_str(), value.as_str()));
    }

    if node.children.is_empty() && node.text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if !node.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&node.text)))?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(&node.name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigurationFile, ParserKind};
    use serde_json::json;

    fn run(contents: &str, replace: Vec<Replacement>) -> String {
        let file = ConfigurationFile {
            file: "config.xml".into(),
            parser: ParserKind::Xml,
            replace,
            allow_create: true,
        };
        String::from_utf8(file.parse(contents.as_bytes(), &json!({})).unwrap()).unwrap()
    }

    #[test]
    fn sets_element_text() {
        let out = run(
            "<Server><Port>7777</Port></Server>",
            vec![Replacement {
                matches: "Server.Port".into(),
                if_value: None,
                replace_with: json!("25565"),
            }],
        );
        assert!(out.contains("<Port>25565</Port>"), "{out}");
    }

    #[test]
    fn attribute_suffix_on_match_targets_attribute() {
        let out = run(
            "<Root><Property value=\"old\"/></Root>",
            vec![Replacement {
                matches: "Root.Property[value='']".into(),
                if_value: None,
                replace_with: json!("testing"),
            }],
        );
        assert!(out.contains("<Property value=\"testing\"/>"), "{out}");
    }

    #[test]
    fn attribute_shaped_value_targets_attribute() {
        let out = run(
            "<Root><Property/></Root>",
            vec![Replacement {
                matches: "Root.Property".into(),
                if_value: None,
                replace_with: json!("[value='testing']"),
            }],
        );
        assert!(out.contains("<Property value=\"testing\"/>"), "{out}");
    }

    #[test]
    fn creates_missing_elements() {
        let out = run(
            "<Config/>",
            vec![Replacement {
                matches: "Config.Network.Ip".into(),
                if_value: None,
                replace_with: json!("0.0.0.0"),
            }],
        );
        assert!(out.contains("<Network>"), "{out}");
        assert!(out.contains("<Ip>0.0.0.0</Ip>"), "{out}");
    }
}
