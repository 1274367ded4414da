//! A small typed YAML document tree and its block-style emitter.
//!
//! Escaping is decided by node kind, never by call site: every
//! [`Scalar::Quoted`] is sanitized and double-quoted, every [`Node::Block`]
//! is re-indented under its key, and keys are checked against a fixed
//! alphabet. A caller therefore cannot add structure through a value.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("manifest root must be a mapping")]
    RootNotMapping,

    #[error("invalid manifest key {0:?}")]
    InvalidKey(String),

    #[error("duplicate manifest key {0:?}")]
    DuplicateKey(String),

    #[error("block literal cannot be a sequence item")]
    BlockInSequence,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Quoted(String),
    Int(i64),
    Bool(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Map(Vec<(String, Node)>),
    Seq(Vec<Node>),
    /// Multi-line text emitted as a `|` literal; content is not escaped.
    Block(String),
    Scalar(Scalar),
}

impl Node {
    pub fn block(text: impl Into<String>) -> Self {
        Self::Block(text.into())
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Self::Scalar(Scalar::Quoted(value.to_string()))
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Self::Scalar(Scalar::Quoted(value))
    }
}

impl From<&String> for Node {
    fn from(value: &String) -> Self {
        Self::Scalar(Scalar::Quoted(value.clone()))
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Self::Scalar(Scalar::Int(value))
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Self::Scalar(Scalar::Bool(value))
    }
}

impl From<Mapping> for Node {
    fn from(value: Mapping) -> Self {
        Self::Map(value.0)
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Self::Seq(value)
    }
}

/// Ordered mapping builder.
#[derive(Clone, Debug, Default)]
pub struct Mapping(Vec<(String, Node)>);

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Node>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Node>) {
        self.0.push((key.to_string(), value.into()));
    }
}

pub fn to_yaml(root: &Node) -> Result<String, RenderError> {
    let Node::Map(entries) = root else {
        return Err(RenderError::RootNotMapping);
    };
    let mut out = String::new();
    write_map(&mut out, entries, 0)?;
    Ok(out)
}

/// Content of a double-quoted scalar: control characters dropped, `\` and `"`
/// escaped.
pub fn escape_quoted(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\u{2028}' | '\u{2029}' | '\u{feff}' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

fn validate_key(key: &str) -> Result<(), RenderError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(RenderError::InvalidKey(key.to_string()))
    }
}

fn write_map(out: &mut String, entries: &[(String, Node)], indent: usize) -> Result<(), RenderError> {
    let pad = " ".repeat(indent);
    for (idx, (key, value)) in entries.iter().enumerate() {
        validate_key(key)?;
        if entries[..idx].iter().any(|(seen, _)| seen == key) {
            return Err(RenderError::DuplicateKey(key.clone()));
        }
        out.push_str(&pad);
        out.push_str(key);
        out.push(':');
        match value {
            Node::Map(inner) if inner.is_empty() => out.push_str(" {}\n"),
            Node::Map(inner) => {
                out.push('\n');
                write_map(out, inner, indent + 2)?;
            }
            Node::Seq(items) if items.is_empty() => out.push_str(" []\n"),
            Node::Seq(items) => {
                out.push('\n');
                write_seq(out, items, indent + 2)?;
            }
            Node::Block(text) => write_block(out, text, indent + 2),
            Node::Scalar(scalar) => {
                out.push(' ');
                write_scalar(out, scalar);
                out.push('\n');
            }
        }
    }
    Ok(())
}

fn write_seq(out: &mut String, items: &[Node], indent: usize) -> Result<(), RenderError> {
    let pad = " ".repeat(indent);
    for item in items {
        out.push_str(&pad);
        match item {
            Node::Map(inner) if inner.is_empty() => out.push_str("- {}\n"),
            Node::Map(inner) => {
                // Emit one level deeper, then fold the first line onto the dash.
                let mut nested = String::new();
                write_map(&mut nested, inner, indent + 2)?;
                out.push_str("- ");
                out.push_str(&nested[indent + 2..]);
            }
            Node::Seq(inner) if inner.is_empty() => out.push_str("- []\n"),
            Node::Seq(inner) => {
                out.push_str("-\n");
                write_seq(out, inner, indent + 2)?;
            }
            Node::Block(_) => return Err(RenderError::BlockInSequence),
            Node::Scalar(scalar) => {
                out.push_str("- ");
                write_scalar(out, scalar);
                out.push('\n');
            }
        }
    }
    Ok(())
}

fn write_scalar(out: &mut String, scalar: &Scalar) {
    match scalar {
        Scalar::Quoted(raw) => {
            out.push('"');
            out.push_str(&escape_quoted(raw));
            out.push('"');
        }
        Scalar::Int(value) => out.push_str(&value.to_string()),
        Scalar::Bool(value) => out.push_str(if *value { "true" } else { "false" }),
    }
}

fn write_block(out: &mut String, text: &str, indent: usize) {
    let body = text.trim_end_matches(['\n', '\r']);
    // A leading space on the first content line would otherwise be read as
    // the block's indentation.
    let explicit_indent = body
        .lines()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.starts_with([' ', '\t']));
    out.push_str(" |");
    if explicit_indent {
        out.push('2');
    }
    out.push('\n');
    let pad = " ".repeat(indent);
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str(&pad);
            out.push_str(line);
            out.push('\n');
        }
    }
}
