//! Encoder for the binary node format.
//! Writes nodes with string tag, string attrs, and content as bytes or list of child nodes.

use super::{token, Node, NodeContent};
use crate::Error;

const MAX_BINARY_20: usize = 0x0F_FFFF;

fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn write_u16_be(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_u20_be(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&[((v >> 16) & 0x0F) as u8, (v >> 8) as u8, v as u8]);
}

fn write_bytes_with_len(out: &mut Vec<u8>, b: &[u8]) -> Result<(), Error> {
    let len = b.len();
    if len <= u8::MAX as usize {
        write_u8(out, token::BINARY_8);
        write_u8(out, len as u8);
    } else if len <= MAX_BINARY_20 {
        write_u8(out, token::BINARY_20);
        write_u20_be(out, len as u32);
    } else {
        return Err(Error::Binary("bytes too long for BINARY_20".into()));
    }
    out.extend_from_slice(b);
    Ok(())
}

fn write_list_start(out: &mut Vec<u8>, size: usize) -> Result<(), Error> {
    if size <= u8::MAX as usize {
        write_u8(out, token::LIST_8);
        write_u8(out, size as u8);
    } else if size <= u16::MAX as usize {
        write_u8(out, token::LIST_16);
        write_u16_be(out, size as u16);
    } else {
        return Err(Error::Binary("list too long for LIST_16".into()));
    }
    Ok(())
}

/// Encode a node to the binary format.
pub fn encode_node(node: &Node, out: &mut Vec<u8>) -> Result<(), Error> {
    let has_content = !matches!(node.content, NodeContent::Empty);
    let list_size = 1 + 2 * node.attrs.len() + usize::from(has_content);
    write_list_start(out, list_size)?;

    write_bytes_with_len(out, node.tag.as_bytes())?;
    for (k, v) in &node.attrs {
        write_bytes_with_len(out, k.as_bytes())?;
        write_bytes_with_len(out, v.as_bytes())?;
    }

    match &node.content {
        NodeContent::Empty => {}
        NodeContent::Bytes(b) => write_bytes_with_len(out, b)?,
        NodeContent::Nodes(children) => {
            write_list_start(out, children.len())?;
            for child in children {
                encode_node(child, out)?;
            }
        }
    }
    Ok(())
}
