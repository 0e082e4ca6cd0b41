//! Decoder for the binary node format.
//! Supports nodes with string tag, string attrs, and content as bytes or list of child nodes.

use super::{token, Attrs, Node, NodeContent};
use crate::Error;

/// Nesting deeper than this is treated as malformed.
const MAX_DEPTH: usize = 64;

fn check_eos(data: &[u8], position: usize, len: usize) -> crate::Result<()> {
    if position + len <= data.len() {
        Ok(())
    } else {
        Err(Error::Binary("unexpected eof".into()))
    }
}

/// Decodes one binary protocol node (no dictionary tokens; strings as BINARY_8/BINARY_20).
pub fn decode(data: &[u8]) -> crate::Result<Node> {
    let mut d = Decoder::new(data);
    let node = d.read_node(0)?;
    if d.pos != data.len() {
        return Err(Error::Binary(format!(
            "{} trailing bytes after node",
            data.len() - d.pos
        )));
    }
    Ok(node)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> crate::Result<u8> {
        check_eos(self.data, self.pos, 1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16_be(&mut self) -> crate::Result<u16> {
        check_eos(self.data, self.pos, 2)?;
        let b = &self.data[self.pos..self.pos + 2];
        self.pos += 2;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u20_be(&mut self) -> crate::Result<u32> {
        check_eos(self.data, self.pos, 3)?;
        let b = &self.data[self.pos..self.pos + 3];
        self.pos += 3;
        Ok(((b[0] as u32 & 0x0F) << 16) | ((b[1] as u32) << 8) | (b[2] as u32))
    }

    fn read_bytes(&mut self, len: usize) -> crate::Result<Vec<u8>> {
        check_eos(self.data, self.pos, len)?;
        let out = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn read_string(&mut self) -> crate::Result<String> {
        let tag = self.read_u8()?;
        let bytes = match tag {
            token::LIST_EMPTY => return Ok(String::new()),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                self.read_bytes(len)?
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                self.read_bytes(len)?
            }
            _ => return Err(Error::Binary(format!("unsupported string token {}", tag))),
        };
        String::from_utf8(bytes).map_err(|e| Error::Binary(e.to_string()))
    }

    fn read_list_size(&mut self, list_tag: u8) -> crate::Result<usize> {
        match list_tag {
            token::LIST_8 => Ok(self.read_u8()? as usize),
            token::LIST_16 => Ok(self.read_u16_be()? as usize),
            _ => Err(Error::Binary(format!(
                "unsupported list token {}",
                list_tag
            ))),
        }
    }

    fn read_node(&mut self, depth: usize) -> crate::Result<Node> {
        if depth > MAX_DEPTH {
            return Err(Error::Binary("node nesting too deep".into()));
        }
        let list_tag = self.read_u8()?;
        let list_size = self.read_list_size(list_tag)?;
        if list_size == 0 {
            return Err(Error::Binary("empty list size for node".into()));
        }
        let tag = self.read_string()?;
        let attr_count = (list_size - 1) / 2;
        let has_content = (list_size % 2) == 0;

        let mut attrs = Attrs::new();
        for _ in 0..attr_count {
            let k = self.read_string()?;
            let v = self.read_string()?;
            attrs.insert(k, v);
        }

        let content = if has_content {
            self.read_content(depth)?
        } else {
            NodeContent::Empty
        };

        Ok(Node {
            tag,
            attrs,
            content,
        })
    }

    fn read_content(&mut self, depth: usize) -> crate::Result<NodeContent> {
        let tag = self.read_u8()?;
        match tag {
            token::LIST_EMPTY => Ok(NodeContent::Empty),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                Ok(NodeContent::Bytes(self.read_bytes(len)?))
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                Ok(NodeContent::Bytes(self.read_bytes(len)?))
            }
            token::LIST_8 | token::LIST_16 => {
                let n = self.read_list_size(tag)?;
                // every child needs at least 3 bytes; refuse absurd counts before allocating
                check_eos(self.data, self.pos, n.saturating_mul(3))?;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    children.push(self.read_node(depth + 1)?);
                }
                Ok(NodeContent::Nodes(children))
            }
            _ => Err(Error::Binary(format!("unsupported content token {}", tag))),
        }
    }
}
