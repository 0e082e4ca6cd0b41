//! Binary protocol nodes.
//! WhatsApp uses a custom binary XML-like node format over the Noise socket.

mod consts;
mod decoder;
mod encoder;
mod token;

pub use consts::{DICT_VERSION, WA_CONN_HEADER, WA_MAGIC_VALUE};

use crate::types::Jid;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Attributes on a node. Sorted so that encoding is deterministic.
pub type Attrs = BTreeMap<String, String>;

/// Content of a node: either child nodes or raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NodeContent {
    #[default]
    Empty,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

/// A single binary protocol node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, k: impl Into<String>, v: impl ToString) -> Self {
        self.attrs.insert(k.into(), v.to_string());
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn with_content(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    pub fn attr(&self, k: &str) -> Option<&str> {
        self.attrs.get(k).map(String::as_str)
    }

    /// Required attribute; missing attributes are a protocol violation.
    pub fn require_attr(&self, k: &str) -> Result<&str> {
        self.attr(k).ok_or_else(|| {
            Error::ProtocolViolation(format!("<{}> missing attribute {}", self.tag, k))
        })
    }

    pub fn attr_jid(&self, k: &str) -> Option<Jid> {
        self.attr(k).and_then(|v| v.parse().ok())
    }

    pub fn require_jid(&self, k: &str) -> Result<Jid> {
        self.require_attr(k)?.parse().map_err(|e| {
            Error::ProtocolViolation(format!("<{}> attribute {}: {}", self.tag, k, e))
        })
    }

    pub fn attr_u64(&self, k: &str) -> Option<u64> {
        self.attr(k).and_then(|v| v.parse().ok())
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.get_children().iter().find(|n| n.tag == tag)
    }

    /// Follow a path of child tags.
    pub fn get_optional_child_by_path(&self, path: &[&str]) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, tag| node.get_child_by_tag(tag))
    }

    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(n) => n,
            _ => &[],
        }
    }

    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Bytes content of a required child.
    pub fn child_bytes(&self, tag: &str) -> Result<&[u8]> {
        self.get_child_by_tag(tag)
            .and_then(Node::bytes)
            .ok_or_else(|| Error::ProtocolViolation(format!("<{}> missing <{}>", self.tag, tag)))
    }

    /// Encode to the binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        encoder::encode_node(self, &mut out)?;
        Ok(out)
    }

    /// Decode from the binary wire form. Trailing bytes are rejected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        decoder::decode(data)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in &self.attrs {
            write!(f, " {}=\"{}\"", k, v)?;
        }
        match &self.content {
            NodeContent::Empty => write!(f, "/>"),
            NodeContent::Bytes(b) => write!(f, "><!-- {} bytes --></{}>", b.len(), self.tag),
            NodeContent::Nodes(children) => {
                write!(f, ">")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}
