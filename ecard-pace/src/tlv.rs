//! BER-TLV (tag, length, value) encoding and decoding.
//!
//! Nested structures are kept as a linked tree: every node points to its first child (if it is
//! constructed) and to its next sibling. This keeps re-encoding a matter of walking the links.


use std::fmt;
use std::hash::{Hash, Hasher};

use rasn::types::Oid;


/// Deepest nesting of constructed values accepted when parsing.
pub const MAX_NESTING_DEPTH: usize = 32;


#[derive(Clone, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("malformed TLV: {reason}")]
    MalformedTlv { reason: &'static str },

    #[error("expected tag {expected}, obtained {obtained}")]
    UnexpectedTag { expected: Tag, obtained: Tag },

    #[error("missing tag {tag}")]
    MissingTag { tag: Tag },
}
impl Error {
    const fn malformed(reason: &'static str) -> Self {
        Self::MalformedTlv { reason }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}
impl TagClass {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Universal,
            0b01 => Self::Application,
            0b10 => Self::ContextSpecific,
            _ => Self::Private,
        }
    }

    const fn to_bits(self) -> u8 {
        match self {
            Self::Universal => 0b00,
            Self::Application => 0b01,
            Self::ContextSpecific => 0b10,
            Self::Private => 0b11,
        }
    }
}


/// A BER tag: class, constructed flag and tag number.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag {
    pub class: TagClass,
    pub constructed: bool,
    pub number: u32,
}
impl Tag {
    pub const INTEGER: Tag = Tag::new(TagClass::Universal, false, 0x02);
    pub const BIT_STRING: Tag = Tag::new(TagClass::Universal, false, 0x03);
    pub const OCTET_STRING: Tag = Tag::new(TagClass::Universal, false, 0x04);
    pub const OBJECT_IDENTIFIER: Tag = Tag::new(TagClass::Universal, false, 0x06);
    pub const SEQUENCE: Tag = Tag::new(TagClass::Universal, true, 0x10);
    pub const SET: Tag = Tag::new(TagClass::Universal, true, 0x11);

    /// `0x7C`: dynamic authentication data.
    pub const DYNAMIC_AUTHENTICATION_DATA: Tag = Tag::new(TagClass::Application, true, 0x1C);

    /// `0x7F49`: public key.
    pub const PUBLIC_KEY: Tag = Tag::new(TagClass::Application, true, 0x49);

    /// `0x7F4C`: certificate holder authorization template.
    pub const CHAT: Tag = Tag::new(TagClass::Application, true, 0x4C);

    pub const fn new(class: TagClass, constructed: bool, number: u32) -> Self {
        Self { class, constructed, number }
    }

    /// A primitive context-specific tag, e.g. `context(0x06)` for `0x86`.
    pub const fn context(number: u32) -> Self {
        Self::new(TagClass::ContextSpecific, false, number)
    }

    /// Decodes a tag from the start of the slice, returning it and the rest of the slice.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        let Some((&first, mut rest)) = bytes.split_first() else {
            return Err(Error::malformed("missing tag"));
        };
        let class = TagClass::from_bits(first >> 6);
        let constructed = first & 0b0010_0000 != 0;
        let low_bits = first & 0b0001_1111;

        if low_bits != 0b0001_1111 {
            return Ok((Self::new(class, constructed, low_bits.into()), rest));
        }

        // multi-byte tag number: base-128, high bit set on all but the last byte
        let mut number: u32 = 0;
        loop {
            let Some((&b, next)) = rest.split_first() else {
                return Err(Error::malformed("truncated tag"));
            };
            rest = next;
            number = number.checked_mul(128)
                .ok_or(Error::malformed("tag number too large"))?
                | u32::from(b & 0b0111_1111);
            if b & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok((Self::new(class, constructed, number), rest))
    }

    pub fn write(&self, output: &mut Vec<u8>) {
        let mut first = (self.class.to_bits() << 6) | if self.constructed { 0b0010_0000 } else { 0 };
        if self.number < 0b0001_1111 {
            first |= self.number as u8;
            output.push(first);
            return;
        }

        output.push(first | 0b0001_1111);
        encode_base128(output, self.number);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(2);
        self.write(&mut ret);
        ret
    }
}
impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", hex::encode_upper(self.to_bytes()))
    }
}
impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode_upper(self.to_bytes()))
    }
}


fn encode_base128(output: &mut Vec<u8>, value: u32) {
    const SEVEN_BIT_MASK: u32 = 0b0111_1111;
    const TOP_BIT: u8 = 0b1000_0000;

    let mut shift = 28;
    while shift > 0 && (value >> shift) & SEVEN_BIT_MASK == 0 {
        shift -= 7;
    }
    while shift > 0 {
        output.push(((value >> shift) & SEVEN_BIT_MASK) as u8 | TOP_BIT);
        shift -= 7;
    }
    output.push((value & SEVEN_BIT_MASK) as u8);
}


/// Encodes a BER length in its shortest definite form.
pub fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional big-endian bytes holding the length
        let length_bytes = length.to_be_bytes();
        let skip = length_bytes.iter().take_while(|b| **b == 0x00).count();
        let trimmed = &length_bytes[skip..];
        output.push(0b1000_0000 | trimmed.len() as u8);
        output.extend(trimmed);
    }
}


/// Decodes a definite BER length from the start of the slice.
///
/// Returns the length and the rest of the slice.
pub fn decode_length(input: &[u8]) -> Result<(usize, &[u8]), Error> {
    let Some((&start_byte, rest)) = input.split_first() else {
        return Err(Error::malformed("missing length"));
    };
    if start_byte & 0b1000_0000 == 0 {
        return Ok((start_byte.into(), rest));
    }

    let length_byte_count = usize::from(start_byte & 0b0111_1111);
    if length_byte_count == 0 {
        return Err(Error::malformed("indefinite length"));
    }
    if length_byte_count > 4 {
        return Err(Error::malformed("length field too long"));
    }
    if length_byte_count > rest.len() {
        return Err(Error::malformed("truncated length"));
    }
    let length = rest[..length_byte_count].iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Ok((length, &rest[length_byte_count..]))
}


/// Encodes a single TLV with the given tag and raw value.
pub fn encode(tag: Tag, value: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(value.len() + 6);
    tag.write(&mut ret);
    encode_length(&mut ret, value.len());
    ret.extend(value);
    ret
}


/// The value of a TLV node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Value {
    Primitive(Vec<u8>),

    /// A constructed value; holds the first child, which links to the others.
    Constructed(Option<Box<Tlv>>),
}


/// A TLV node with links to its first child and its next sibling.
///
/// Sibling chains are walked in loops, never recursively, so their length is bounded only by
/// memory. Recursion follows the nesting depth, which parsing caps at [`MAX_NESTING_DEPTH`].
pub struct Tlv {
    tag: Tag,
    value: Value,
    next: Option<Box<Tlv>>,
}
impl Tlv {
    pub fn primitive(tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        Self { tag, value: Value::Primitive(value.into()), next: None }
    }

    /// Creates a constructed node from its children, linking them as siblings.
    pub fn constructed(tag: Tag, children: impl IntoIterator<Item = Tlv>) -> Self {
        Self { tag, value: Value::Constructed(link_siblings(children)), next: None }
    }

    pub fn tag(&self) -> Tag { self.tag }
    pub fn value(&self) -> &Value { &self.value }
    pub fn next(&self) -> Option<&Tlv> { self.next.as_deref() }

    pub fn first_child(&self) -> Option<&Tlv> {
        match &self.value {
            Value::Primitive(_) => None,
            Value::Constructed(child) => child.as_deref(),
        }
    }

    /// The value bytes of a primitive node.
    pub fn primitive_value(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Primitive(bytes) => Some(bytes),
            Value::Constructed(_) => None,
        }
    }

    /// Parses the whole input as a chain of sibling TLVs, returning the first.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        Self::parse_chain(bytes, 0)
    }

    /// Parses one TLV from the start of the input, returning it and the unparsed rest.
    pub fn parse_one(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        Self::parse_node(bytes, 0)
    }

    fn parse_chain(bytes: &[u8], depth: usize) -> Result<Self, Error> {
        let (first, rest) = Self::parse_node(bytes, depth)?;
        let mut nodes = vec![first];
        let mut remaining = rest;
        while !remaining.is_empty() {
            let (node, rest) = Self::parse_node(remaining, depth)?;
            nodes.push(node);
            remaining = rest;
        }
        link_siblings(nodes)
            .map(|b| *b)
            .ok_or(Error::malformed("empty input"))
    }

    fn parse_node(bytes: &[u8], depth: usize) -> Result<(Self, &[u8]), Error> {
        let (tag, rest) = Tag::parse(bytes)?;
        let (length, rest) = decode_length(rest)?;
        if length > rest.len() {
            return Err(Error::malformed("value shorter than length"));
        }
        let (content, rest) = rest.split_at(length);

        let value = if tag.constructed {
            if content.is_empty() {
                Value::Constructed(None)
            } else if depth >= MAX_NESTING_DEPTH {
                return Err(Error::malformed("nesting too deep"));
            } else {
                Value::Constructed(Some(Box::new(Self::parse_chain(content, depth + 1)?)))
            }
        } else {
            Value::Primitive(content.to_vec())
        };
        Ok((Self { tag, value, next: None }, rest))
    }

    /// Encodes this node only, ignoring its siblings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::new();
        self.write(&mut ret);
        ret
    }

    /// Encodes this node followed by all of its siblings.
    pub fn chain_to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::new();
        for node in self.siblings() {
            node.write(&mut ret);
        }
        ret
    }

    fn write(&self, output: &mut Vec<u8>) {
        self.tag.write(output);
        match &self.value {
            Value::Primitive(bytes) => {
                encode_length(output, bytes.len());
                output.extend(bytes);
            },
            Value::Constructed(child) => {
                let content = child.as_ref()
                    .map(|c| c.chain_to_bytes())
                    .unwrap_or_default();
                encode_length(output, content.len());
                output.extend(content);
            },
        }
    }

    /// Iterates over this node and its following siblings.
    pub fn siblings(&self) -> Siblings<'_> {
        Siblings { current: Some(self) }
    }

    /// Iterates over the children of a constructed node.
    pub fn children(&self) -> Siblings<'_> {
        Siblings { current: self.first_child() }
    }

    /// Finds the first child with the given tag.
    pub fn find_child(&self, tag: Tag) -> Option<&Tlv> {
        self.children().find(|c| c.tag == tag)
    }

    /// Ensures this node carries the given tag.
    pub fn expect_tag(&self, tag: Tag) -> Result<&Self, Error> {
        if self.tag == tag {
            Ok(self)
        } else {
            Err(Error::UnexpectedTag { expected: tag, obtained: self.tag })
        }
    }
}


impl Clone for Tlv {
    fn clone(&self) -> Self {
        let followers: Vec<&Tlv> = self.siblings().skip(1).collect();
        let next = followers.into_iter()
            .rev()
            .fold(None, |next, node| Some(Box::new(Tlv { tag: node.tag, value: node.value.clone(), next })));
        Tlv { tag: self.tag, value: self.value.clone(), next }
    }
}
impl fmt::Debug for Tlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.siblings().map(|node| (node.tag, &node.value)))
            .finish()
    }
}
impl PartialEq for Tlv {
    fn eq(&self, other: &Self) -> bool {
        self.siblings().map(|node| (node.tag, &node.value))
            .eq(other.siblings().map(|node| (node.tag, &node.value)))
    }
}
impl Eq for Tlv {}
impl Hash for Tlv {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for node in self.siblings() {
            node.tag.hash(state);
            node.value.hash(state);
        }
    }
}
impl Drop for Tlv {
    fn drop(&mut self) {
        // unlink everything first so that dropping a node never recurses
        let mut pending: Vec<Box<Tlv>> = Vec::new();
        pending.extend(self.next.take());
        if let Value::Constructed(child) = &mut self.value {
            pending.extend(child.take());
        }
        while let Some(mut node) = pending.pop() {
            pending.extend(node.next.take());
            if let Value::Constructed(child) = &mut node.value {
                pending.extend(child.take());
            }
        }
    }
}


fn link_siblings(nodes: impl IntoIterator<Item = Tlv>) -> Option<Box<Tlv>> {
    let nodes: Vec<Tlv> = nodes.into_iter().collect();
    let mut head: Option<Box<Tlv>> = None;
    for mut node in nodes.into_iter().rev() {
        node.next = head;
        head = Some(Box::new(node));
    }
    head
}


pub struct Siblings<'t> {
    current: Option<&'t Tlv>,
}
impl<'t> Iterator for Siblings<'t> {
    type Item = &'t Tlv;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.next.as_deref();
        Some(current)
    }
}


/// Encode an object identifier value into bytes using DER encoding rules.
///
/// No tag or length is encoded, only the actual value.
pub fn oid_to_der_bytes(oid: &Oid) -> Vec<u8> {
    let mut ret = Vec::with_capacity(oid.len() + 2);
    let mut arcs = oid.iter().copied();
    let first = arcs.next().unwrap_or(0);
    let second = arcs.next().unwrap_or(0);
    encode_base128(&mut ret, 40 * first + second);
    for arc in arcs {
        encode_base128(&mut ret, arc);
    }
    ret
}


/// Renders an object identifier in dotted notation.
pub fn oid_to_string(oid: &Oid) -> String {
    oid.iter()
        .map(|arc| arc.to_string())
        .collect::<Vec<_>>()
        .join(".")
}
