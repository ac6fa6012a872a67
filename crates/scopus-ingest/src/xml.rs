//! Read-only XML element tree with a small path query language
//!
//! Documents are parsed once with quick-xml's namespace-aware reader into
//! an arena of elements. Queries cover the subset of XPath used by the
//! extractor:
//!
//! ```text
//! /xocs:doc/xocs:meta/xocs:eid/text()
//! /xocs:doc/xocs:item/item/bibrecord/head/citation-title/titletext[@original="y"]/@xml:lang
//! .//issn[@type='print']/text()
//! ./@type   @auid   citation-type/@*
//! ```
//!
//! Unprefixed names match elements in no namespace.

use std::borrow::Cow;

use quick_xml::NsReader;
use quick_xml::events::attributes::Attribute as RawAttribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;

/// Prefixes understood in query expressions
pub const NAMESPACES: &[(&str, &str)] = &[
    ("xocs", "http://www.elsevier.com/xml/xocs/dtd"),
    ("cto", "http://www.elsevier.com/xml/cto/dtd"),
    ("ce", "http://www.elsevier.com/xml/ani/common"),
    ("xml", "http://www.w3.org/XML/1998/namespace"),
];

fn namespace_uri(prefix: &str) -> Option<&'static str> {
    NAMESPACES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, uri)| *uri)
}

// =============================================================================
// Errors
// =============================================================================

/// Deepest element nesting accepted by [`XmlTree::parse`], the same
/// limit libxml2 applies without its huge-tree option.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug)]
pub enum XmlError {
    Syntax { position: u64, message: String },
    TooDeep { position: u64 },
    NoRoot,
    Query { expr: String, message: String },
}

impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax { position, message } => {
                write!(f, "XML syntax error at byte {position}: {message}")
            }
            Self::TooDeep { position } => {
                write!(f, "XML nesting deeper than {MAX_DEPTH} at byte {position}")
            }
            Self::NoRoot => write!(f, "XML document has no root element"),
            Self::Query { expr, message } => write!(f, "bad query {expr:?}: {message}"),
        }
    }
}

impl std::error::Error for XmlError {}

// =============================================================================
// Tree
// =============================================================================

#[derive(Debug)]
struct Attribute {
    ns: Option<String>,
    name: String,
    value: String,
}

#[derive(Debug)]
enum Child {
    Element(usize),
    Text(String),
}

#[derive(Debug)]
struct Element {
    ns: Option<String>,
    name: String,
    attrs: Vec<Attribute>,
    children: Vec<Child>,
}

/// Parsed document. Index 0 is the document node; elements follow in
/// document order.
#[derive(Debug)]
pub struct XmlTree {
    nodes: Vec<Element>,
}

impl XmlTree {
    /// Parse raw bytes. Text that is not valid UTF-8 or carries unknown
    /// entities is kept lossily instead of failing the document.
    pub fn parse(bytes: &[u8]) -> Result<Self, XmlError> {
        let mut reader = NsReader::from_reader(bytes);
        let mut nodes = vec![Element {
            ns: None,
            name: String::new(),
            attrs: Vec::new(),
            children: Vec::new(),
        }];
        let mut stack = vec![0usize];
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let (resolved, event) = match reader.read_resolved_event_into(&mut buf) {
                Ok(ok) => ok,
                Err(e) => {
                    return Err(XmlError::Syntax {
                        position: reader.buffer_position() as u64,
                        message: e.to_string(),
                    });
                }
            };
            let ns = namespace_of(resolved);

            match event {
                Event::Start(e) => {
                    // the document node sits at the bottom of the stack
                    if stack.len() > MAX_DEPTH {
                        return Err(XmlError::TooDeep {
                            position: reader.buffer_position() as u64,
                        });
                    }
                    let id = push_element(&mut nodes, &stack, &reader, ns, &e);
                    stack.push(id);
                }
                Event::Empty(e) => {
                    push_element(&mut nodes, &stack, &reader, ns, &e);
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(XmlError::Syntax {
                            position: reader.buffer_position() as u64,
                            message: "unexpected end tag".to_string(),
                        });
                    }
                    stack.pop();
                }
                Event::Text(e) => {
                    let text = match e.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(_) => String::from_utf8_lossy(&e).into_owned(),
                    };
                    push_text(&mut nodes, &stack, text);
                }
                Event::CData(e) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    push_text(&mut nodes, &stack, text);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() > 1 {
            return Err(XmlError::Syntax {
                position: reader.buffer_position() as u64,
                message: format!("unclosed element <{}>", nodes[stack[stack.len() - 1]].name),
            });
        }
        let tree = Self { nodes };
        if tree.root_element().is_none() {
            return Err(XmlError::NoRoot);
        }
        Ok(tree)
    }

    /// The document node; absolute queries start here.
    pub fn document(&self) -> Node<'_> {
        Node { tree: self, id: 0 }
    }

    /// The outermost element.
    pub fn root_element(&self) -> Option<Node<'_>> {
        self.document().children().next()
    }
}

fn namespace_of(resolved: ResolveResult<'_>) -> Option<String> {
    match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound | ResolveResult::Unknown(_) => None,
    }
}

fn push_element(
    nodes: &mut Vec<Element>,
    stack: &[usize],
    reader: &NsReader<&[u8]>,
    ns: Option<String>,
    start: &BytesStart<'_>,
) -> usize {
    let attrs = start
        .attributes()
        .flatten()
        .filter(|attr| attr.key.as_namespace_binding().is_none())
        .map(|attr| {
            let (resolved, local) = reader.resolve_attribute(attr.key);
            Attribute {
                ns: namespace_of(resolved),
                name: String::from_utf8_lossy(local.as_ref()).into_owned(),
                value: attribute_value(&attr),
            }
        })
        .collect();

    let id = nodes.len();
    nodes.push(Element {
        ns,
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        attrs,
        children: Vec::new(),
    });
    if let Some(&parent) = stack.last() {
        nodes[parent].children.push(Child::Element(id));
    }
    id
}

fn attribute_value(attr: &RawAttribute<'_>) -> String {
    match attr.unescape_value() {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
    }
}

/// Append text to the current element, merging with a preceding text child.
fn push_text(nodes: &mut [Element], stack: &[usize], text: String) {
    let Some(&current) = stack.last() else {
        return;
    };
    // text outside the root element is prolog whitespace
    if current == 0 {
        return;
    }
    let children = &mut nodes[current].children;
    match children.last_mut() {
        Some(Child::Text(prev)) => prev.push_str(&text),
        _ => children.push(Child::Text(text)),
    }
}

// =============================================================================
// Node handle
// =============================================================================

/// Borrowed handle to one element of an [`XmlTree`].
#[derive(Clone, Copy)]
pub struct Node<'t> {
    tree: &'t XmlTree,
    id: usize,
}

impl std::fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>#{}", self.name(), self.id)
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tree, other.tree) && self.id == other.id
    }
}

impl<'t> Node<'t> {
    fn data(&self) -> &'t Element {
        &self.tree.nodes[self.id]
    }

    /// Local name (empty for the document node).
    pub fn name(&self) -> &'t str {
        &self.data().name
    }

    pub fn namespace(&self) -> Option<&'t str> {
        self.data().ns.as_deref()
    }

    /// Attribute in no namespace.
    pub fn attr(&self, name: &str) -> Option<&'t str> {
        self.data()
            .attrs
            .iter()
            .find(|a| a.ns.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = Node<'t>> + 't {
        let tree = self.tree;
        self.data().children.iter().filter_map(move |c| match c {
            Child::Element(id) => Some(Node { tree, id: *id }),
            Child::Text(_) => None,
        })
    }

    /// Child elements in no namespace named `name`.
    pub fn children_named(&self, name: &'t str) -> impl Iterator<Item = Node<'t>> + 't {
        self.children()
            .filter(move |c| c.namespace().is_none() && c.name() == name)
    }

    /// First child element in no namespace named `name`.
    pub fn child(&self, name: &str) -> Option<Node<'t>> {
        self.children()
            .find(|c| c.namespace().is_none() && c.name() == name)
    }

    /// All descendant text concatenated in document order.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        let nodes = &self.tree.nodes;
        let mut stack = vec![(self.id, 0usize)];
        while let Some((id, next)) = stack.pop() {
            let Some(child) = nodes[id].children.get(next) else {
                continue;
            };
            stack.push((id, next + 1));
            match child {
                Child::Text(text) => out.push_str(text),
                Child::Element(child) => stack.push((*child, 0)),
            }
        }
    }

    /// Descendant element ids in document order.
    fn descendant_ids(&self, out: &mut Vec<usize>) {
        let nodes = &self.tree.nodes;
        let mut stack = vec![(self.id, 0usize)];
        while let Some((id, next)) = stack.pop() {
            let Some(child) = nodes[id].children.get(next) else {
                continue;
            };
            stack.push((id, next + 1));
            if let Child::Element(child) = child {
                out.push(*child);
                stack.push((*child, 0));
            }
        }
    }

    /// Evaluate a query with this node as context.
    pub fn select(&self, expr: &str) -> Result<Vec<Match<'t>>, XmlError> {
        Ok(Query::parse(expr)?.select(*self))
    }
}

/// One query result.
#[derive(Debug, Clone, PartialEq)]
pub enum Match<'t> {
    Node(Node<'t>),
    /// Attribute value or text node
    Value(&'t str),
}

impl<'t> Match<'t> {
    pub fn as_node(&self) -> Option<Node<'t>> {
        match self {
            Self::Node(node) => Some(*node),
            Self::Value(_) => None,
        }
    }

    /// String value: the value itself, or an element's text content.
    pub fn string_value(&self) -> Cow<'t, str> {
        match self {
            Self::Node(node) => Cow::Owned(node.text_content()),
            Self::Value(value) => Cow::Borrowed(value),
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum NameTest {
    Any,
    Name {
        ns: Option<&'static str>,
        local: String,
    },
}

impl NameTest {
    fn parse(raw: &str, expr: &str) -> Result<Self, XmlError> {
        if raw == "*" {
            return Ok(Self::Any);
        }
        if raw.is_empty() {
            return Err(query_error(expr, "empty name"));
        }
        match raw.split_once(':') {
            Some((prefix, local)) => {
                let ns = namespace_uri(prefix)
                    .ok_or_else(|| query_error(expr, &format!("unknown prefix {prefix:?}")))?;
                Ok(Self::Name {
                    ns: Some(ns),
                    local: local.to_string(),
                })
            }
            None => Ok(Self::Name {
                ns: None,
                local: raw.to_string(),
            }),
        }
    }

    fn matches(&self, ns: Option<&str>, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Name { ns: want, local } => *want == ns && local == name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NameTest,
    /// `[@attr="value"]` filters
    predicates: Vec<(NameTest, String)>,
}

#[derive(Debug, Clone)]
enum Terminal {
    Elements,
    Text,
    Attribute(NameTest),
}

/// Compiled query expression.
#[derive(Debug, Clone)]
pub struct Query {
    absolute: bool,
    steps: Vec<Step>,
    terminal: Terminal,
}

fn query_error(expr: &str, message: &str) -> XmlError {
    XmlError::Query {
        expr: expr.to_string(),
        message: message.to_string(),
    }
}

/// Split on `/` outside predicates and quotes.
fn split_segments(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => {
                out.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out
}

impl Query {
    pub fn parse(expr: &str) -> Result<Self, XmlError> {
        let absolute = expr.starts_with('/');
        let segments = split_segments(expr);
        let last = segments.len() - 1;

        let mut steps = Vec::new();
        let mut terminal = Terminal::Elements;
        let mut descendant = false;

        for (i, segment) in segments.into_iter().enumerate() {
            if i == 0 && absolute {
                continue;
            }
            if segment.is_empty() {
                if i == last {
                    return Err(query_error(expr, "trailing '/'"));
                }
                descendant = true;
                continue;
            }
            if segment == "." {
                continue;
            }
            let is_terminal = segment == "text()" || segment.starts_with('@');
            if is_terminal && i != last {
                return Err(query_error(expr, "text() or @attribute must come last"));
            }
            if segment == "text()" {
                if descendant {
                    return Err(query_error(expr, "'//text()' is not supported"));
                }
                terminal = Terminal::Text;
            } else if let Some(name) = segment.strip_prefix('@') {
                if descendant {
                    return Err(query_error(expr, "'//@' is not supported"));
                }
                terminal = Terminal::Attribute(NameTest::parse(name, expr)?);
            } else {
                steps.push(Self::parse_step(segment, descendant, expr)?);
                descendant = false;
            }
        }

        Ok(Self {
            absolute,
            steps,
            terminal,
        })
    }

    fn parse_step(segment: &str, descendant: bool, expr: &str) -> Result<Step, XmlError> {
        let (name, mut rest) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        let mut predicates = Vec::new();
        while !rest.is_empty() {
            let body = rest
                .strip_prefix('[')
                .ok_or_else(|| query_error(expr, "expected '[' after predicate"))?;
            let close = body
                .find(']')
                .ok_or_else(|| query_error(expr, "unclosed '['"))?;
            let inner = body[..close].trim();
            let (attr, value) = inner
                .strip_prefix('@')
                .and_then(|p| p.split_once('='))
                .ok_or_else(|| query_error(expr, "only [@attr=\"value\"] predicates are supported"))?;
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .ok_or_else(|| query_error(expr, "predicate value must be quoted"))?;
            predicates.push((NameTest::parse(attr.trim(), expr)?, unquoted.to_string()));
            rest = &body[close + 1..];
        }
        Ok(Step {
            axis: if descendant {
                Axis::Descendant
            } else {
                Axis::Child
            },
            test: NameTest::parse(name, expr)?,
            predicates,
        })
    }

    /// Evaluate against `context`; absolute queries ignore the context
    /// element and start at its document.
    pub fn select<'t>(&self, context: Node<'t>) -> Vec<Match<'t>> {
        let tree = context.tree;
        let mut current = vec![if self.absolute { 0 } else { context.id }];

        for step in &self.steps {
            let mut next = Vec::new();
            for &id in &current {
                let node = Node { tree, id };
                match step.axis {
                    Axis::Child => next.extend(node.children().map(|c| c.id)),
                    Axis::Descendant => node.descendant_ids(&mut next),
                }
            }
            next.retain(|&id| {
                let el = &tree.nodes[id];
                step.test.matches(el.ns.as_deref(), &el.name)
                    && step.predicates.iter().all(|(attr, want)| {
                        el.attrs
                            .iter()
                            .any(|a| attr.matches(a.ns.as_deref(), &a.name) && a.value == *want)
                    })
            });
            // ids are assigned in document order
            next.sort_unstable();
            next.dedup();
            current = next;
        }

        match &self.terminal {
            Terminal::Elements => current
                .into_iter()
                .map(|id| Match::Node(Node { tree, id }))
                .collect(),
            Terminal::Text => current
                .into_iter()
                .flat_map(|id| {
                    tree.nodes[id].children.iter().filter_map(|c| match c {
                        Child::Text(text) => Some(Match::Value(text.as_str())),
                        Child::Element(_) => None,
                    })
                })
                .collect(),
            Terminal::Attribute(test) => current
                .into_iter()
                .flat_map(|id| {
                    tree.nodes[id]
                        .attrs
                        .iter()
                        .filter(|a| test.matches(a.ns.as_deref(), &a.name))
                        .map(|a| Match::Value(a.value.as_str()))
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xocs:doc xmlns:xocs="http://www.elsevier.com/xml/xocs/dtd"
          xmlns:ce="http://www.elsevier.com/xml/ani/common">
  <xocs:meta><xocs:eid>2-s2.0-123</xocs:eid></xocs:meta>
  <xocs:item><item><bibrecord><head>
    <citation-title>
      <titletext original="n" xml:lang="fre">Titre</titletext>
      <titletext original="y" xml:lang="eng">A <inf>2</inf> title &amp; more</titletext>
    </citation-title>
    <source srcid="42" type="j">
      <issn type="print">12345678</issn>
      <issn type="electronic">87654321</issn>
    </source>
    <author-group>
      <author auid="7" seq="1"><ce:surname>Smith</ce:surname></author>
      <author auid="8" seq="2"><ce:surname>Jones</ce:surname></author>
    </author-group>
  </head></bibrecord></item></xocs:item>
</xocs:doc>"#;

    fn tree() -> XmlTree {
        XmlTree::parse(DOC.as_bytes()).unwrap()
    }

    #[test]
    fn absolute_text() {
        let t = tree();
        let out = t.document().select("/xocs:doc/xocs:meta/xocs:eid/text()").unwrap();
        assert_eq!(out, vec![Match::Value("2-s2.0-123")]);
    }

    #[test]
    fn predicate_and_xml_lang() {
        let t = tree();
        let base = "/xocs:doc/xocs:item/item/bibrecord/head/citation-title/titletext";
        let lang = t.document().select(&format!("{base}[@original=\"y\"]/@xml:lang")).unwrap();
        assert_eq!(lang, vec![Match::Value("eng")]);

        let title = t.document().select(&format!("{base}[@original='y']")).unwrap();
        assert_eq!(title.len(), 1);
        assert_eq!(title[0].string_value(), "A 2 title & more");
    }

    #[test]
    fn relative_descendant_and_attribute() {
        let t = tree();
        let source = t
            .document()
            .select("/xocs:doc/xocs:item/item/bibrecord/head/source")
            .unwrap()[0]
            .as_node()
            .unwrap();
        assert_eq!(source.attr("srcid"), Some("42"));
        assert_eq!(
            source.select(".//issn[@type='print']/text()").unwrap(),
            vec![Match::Value("12345678")]
        );
        assert_eq!(source.select("./@type").unwrap(), vec![Match::Value("j")]);
        assert_eq!(source.select("@*").unwrap().len(), 2);
    }

    #[test]
    fn namespaced_child_and_multiple_matches() {
        let t = tree();
        let authors = t.document().select("//author").unwrap();
        assert_eq!(authors.len(), 2);
        let first = authors[0].as_node().unwrap();
        assert_eq!(first.select("./ce:surname").unwrap()[0].string_value(), "Smith");
        // unprefixed name does not match a namespaced element
        assert!(first.select("surname").unwrap().is_empty());
    }

    #[test]
    fn unknown_prefix_rejected() {
        assert!(Query::parse("/foo:bar").is_err());
    }

    #[test]
    fn malformed_xml_rejected() {
        assert!(XmlTree::parse(b"<a><b></a>").is_err());
        assert!(matches!(XmlTree::parse(b"   "), Err(XmlError::NoRoot)));
    }

    #[test]
    fn invalid_utf8_text_is_lossy() {
        let t = XmlTree::parse(b"<a>caf\xe9</a>").unwrap();
        let text = t.root_element().unwrap().text_content();
        assert!(text.starts_with("caf"));
    }

    #[test]
    fn text_nodes_around_children() {
        let t = XmlTree::parse(b"<a>head<b>x</b>tail</a>").unwrap();
        let root = t.root_element().unwrap();
        assert_eq!(root.text_content(), "headxtail");
        assert_eq!(
            root.select("text()").unwrap(),
            vec![Match::Value("head"), Match::Value("tail")]
        );
    }

    fn nested(depth: usize) -> String {
        format!("<a>{}T{}</a>", "<i>".repeat(depth - 1), "</i>".repeat(depth - 1))
    }

    #[test]
    fn nesting_limit() {
        let t = XmlTree::parse(nested(MAX_DEPTH).as_bytes()).unwrap();
        assert_eq!(t.root_element().unwrap().text_content(), "T");
        assert_eq!(t.document().select("//i").unwrap().len(), MAX_DEPTH - 1);

        assert!(matches!(
            XmlTree::parse(nested(MAX_DEPTH + 1).as_bytes()),
            Err(XmlError::TooDeep { .. })
        ));
        assert!(matches!(
            XmlTree::parse(nested(100_000).as_bytes()),
            Err(XmlError::TooDeep { .. })
        ));
    }

    #[test]
    fn stray_bracket_after_predicate_rejected() {
        assert!(matches!(
            Query::parse("a[@b='c']]"),
            Err(XmlError::Query { .. })
        ));
        assert!(matches!(
            Query::parse("a[@b='c']x"),
            Err(XmlError::Query { .. })
        ));
    }
}
