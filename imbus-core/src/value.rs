//! Value codec: tag byte + little-endian payload for every item carried by a transaction.

use std::fmt;

use crate::key::{KeyEvent, KeyMask};
use crate::transaction::Transaction;

/// Wire tag preceding every encoded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Command = 1,
    UInt32 = 2,
    Int32 = 3,
    Bool = 4,
    Double = 5,
    String = 6,
    WideString = 7,
    KeyEvent = 8,
    AttributeList = 9,
    Property = 10,
    PropertyList = 11,
    LookupTable = 12,
    VecUInt32 = 13,
    VecString = 14,
    VecWideString = 15,
    Raw = 16,
    Transaction = 17,
}

impl DataType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Command,
            2 => Self::UInt32,
            3 => Self::Int32,
            4 => Self::Bool,
            5 => Self::Double,
            6 => Self::String,
            7 => Self::WideString,
            8 => Self::KeyEvent,
            9 => Self::AttributeList,
            10 => Self::Property,
            11 => Self::PropertyList,
            12 => Self::LookupTable,
            13 => Self::VecUInt32,
            14 => Self::VecString,
            15 => Self::VecWideString,
            16 => Self::Raw,
            17 => Self::Transaction,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error decoding a value. The buffer is never modified by a failed decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated: need {needed} bytes at offset {offset}, buffer has {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },
    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: DataType, found: DataType },
    #[error("end of transaction")]
    EndOfData,
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("invalid code point {0:#x}")]
    InvalidCodePoint(u32),
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid double literal")]
    InvalidDouble,
    #[error("invalid attribute kind {0}")]
    InvalidAttributeKind(u8),
    #[error("transactions nested deeper than {MAX_NESTING} levels")]
    NestingTooDeep,
}

/// Deepest chain of nested transactions accepted by the decoder.
pub const MAX_NESTING: usize = 32;

/// UCS-4 string: one `char` per code point on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct WideString(pub Vec<char>);

impl WideString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn chars(&self) -> &[char] {
        &self.0
    }
}

impl From<&str> for WideString {
    fn from(s: &str) -> Self {
        WideString(s.chars().collect())
    }
}

impl From<Vec<char>> for WideString {
    fn from(chars: Vec<char>) -> Self {
        WideString(chars)
    }
}

impl fmt::Display for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|c| fmt::Write::write_char(f, *c))
    }
}

/// What an attribute range changes in preedit or candidate text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeKind {
    None = 0,
    /// `value` is one of the `DECORATE_*` flags.
    Decorate = 1,
    /// `value` is `0x00RRGGBB`.
    Foreground = 2,
    Background = 3,
}

impl AttributeKind {
    fn from_u8(b: u8) -> Result<Self, DecodeError> {
        Ok(match b {
            0 => Self::None,
            1 => Self::Decorate,
            2 => Self::Foreground,
            3 => Self::Background,
            other => return Err(DecodeError::InvalidAttributeKind(other)),
        })
    }
}

pub const DECORATE_UNDERLINE: u32 = 1;
pub const DECORATE_HIGHLIGHT: u32 = 2;
pub const DECORATE_REVERSE: u32 = 4;

/// Styling applied to `length` characters starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub start: u32,
    pub length: u32,
    pub kind: AttributeKind,
    pub value: u32,
}

impl Attribute {
    pub fn new(start: u32, length: u32, kind: AttributeKind, value: u32) -> Self {
        Self {
            start,
            length,
            kind,
            value,
        }
    }
}

/// A status-bar property published by an engine or front end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Property {
    pub key: String,
    pub label: String,
    pub icon: String,
    pub tip: String,
    pub active: bool,
    pub visible: bool,
}

impl Property {
    pub fn new(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            active: true,
            visible: true,
            ..Self::default()
        }
    }
}

/// One candidate row of a lookup table page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidate {
    pub text: WideString,
    pub attributes: Vec<Attribute>,
}

/// Snapshot of the visible page of a candidate lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupTable {
    pub page_size: u32,
    pub cursor_pos: u32,
    pub cursor_visible: bool,
    pub page_up: bool,
    pub page_down: bool,
    pub labels: Vec<WideString>,
    pub candidates: Vec<Candidate>,
}

/// Any item that can be carried in a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Command(i32),
    UInt32(u32),
    Int32(i32),
    Bool(bool),
    Double(f64),
    String(String),
    WideString(WideString),
    KeyEvent(KeyEvent),
    AttributeList(Vec<Attribute>),
    Property(Property),
    PropertyList(Vec<Property>),
    LookupTable(LookupTable),
    VecUInt32(Vec<u32>),
    VecString(Vec<String>),
    VecWideString(Vec<WideString>),
    Raw(Vec<u8>),
    Transaction(Transaction),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Command(_) => DataType::Command,
            Value::UInt32(_) => DataType::UInt32,
            Value::Int32(_) => DataType::Int32,
            Value::Bool(_) => DataType::Bool,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
            Value::WideString(_) => DataType::WideString,
            Value::KeyEvent(_) => DataType::KeyEvent,
            Value::AttributeList(_) => DataType::AttributeList,
            Value::Property(_) => DataType::Property,
            Value::PropertyList(_) => DataType::PropertyList,
            Value::LookupTable(_) => DataType::LookupTable,
            Value::VecUInt32(_) => DataType::VecUInt32,
            Value::VecString(_) => DataType::VecString,
            Value::VecWideString(_) => DataType::VecWideString,
            Value::Raw(_) => DataType::Raw,
            Value::Transaction(_) => DataType::Transaction,
        }
    }
}

// ---- encoding ----

/// Append the tagged encoding of `value` to `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    out.push(value.data_type().tag());
    match value {
        Value::Command(v) | Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::UInt32(v) => put_u32(out, *v),
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Double(d) => put_str(out, &d.to_string()),
        Value::String(s) => put_str(out, s),
        Value::WideString(w) => put_wide(out, w),
        Value::KeyEvent(k) => put_key(out, k),
        Value::AttributeList(attrs) => put_attrs(out, attrs),
        Value::Property(p) => put_property(out, p),
        Value::PropertyList(props) => {
            put_len(out, props.len());
            props.iter().for_each(|p| put_property(out, p));
        }
        Value::LookupTable(t) => put_table(out, t),
        Value::VecUInt32(v) => {
            put_len(out, v.len());
            v.iter().for_each(|x| put_u32(out, *x));
        }
        Value::VecString(v) => {
            put_len(out, v.len());
            v.iter().for_each(|s| put_str(out, s));
        }
        Value::VecWideString(v) => {
            put_len(out, v.len());
            v.iter().for_each(|w| put_wide(out, w));
        }
        Value::Raw(bytes) => put_bytes(out, bytes),
        Value::Transaction(t) => put_bytes(out, t.as_bytes()),
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_len(out: &mut Vec<u8>, n: usize) {
    put_u32(out, n as u32);
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    put_len(out, b.len());
    out.extend_from_slice(b);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_wide(out: &mut Vec<u8>, w: &WideString) {
    put_len(out, w.len());
    w.0.iter().for_each(|c| put_u32(out, *c as u32));
}

fn put_key(out: &mut Vec<u8>, k: &KeyEvent) {
    put_u32(out, k.code);
    out.extend_from_slice(&k.mask.bits().to_le_bytes());
    put_u32(out, k.layout);
}

fn put_attrs(out: &mut Vec<u8>, attrs: &[Attribute]) {
    put_len(out, attrs.len());
    for a in attrs {
        put_u32(out, a.start);
        put_u32(out, a.length);
        out.push(a.kind as u8);
        put_u32(out, a.value);
    }
}

fn put_property(out: &mut Vec<u8>, p: &Property) {
    put_str(out, &p.key);
    put_str(out, &p.label);
    put_str(out, &p.icon);
    put_str(out, &p.tip);
    out.push(u8::from(p.active) | (u8::from(p.visible) << 1));
}

fn put_table(out: &mut Vec<u8>, t: &LookupTable) {
    put_u32(out, t.page_size);
    put_u32(out, t.cursor_pos);
    out.push(u8::from(t.cursor_visible) | (u8::from(t.page_up) << 1) | (u8::from(t.page_down) << 2));
    put_len(out, t.labels.len());
    t.labels.iter().for_each(|l| put_wide(out, l));
    put_len(out, t.candidates.len());
    for c in &t.candidates {
        put_wide(out, &c.text);
        put_attrs(out, &c.attributes);
    }
}

// ---- decoding ----

/// Bounds-checked cursor over an encoded buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                len: self.buf.len(),
            })?;
        let buf = self.buf;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    /// Element count, rejected up front if `count * min_size` cannot fit in what is left.
    fn count(&mut self, min_size: usize) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let n = self.u32()? as usize;
        let remaining = self.buf.len() - self.pos;
        match n.checked_mul(min_size) {
            Some(need) if need <= remaining => Ok(n),
            _ => Err(DecodeError::Truncated {
                offset,
                needed: n.saturating_mul(min_size),
                len: self.buf.len(),
            }),
        }
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let b = self.bytes()?;
        std::str::from_utf8(b)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn wide(&mut self) -> Result<WideString, DecodeError> {
        let n = self.count(4)?;
        let mut chars = Vec::with_capacity(n);
        for _ in 0..n {
            let cp = self.u32()?;
            chars.push(char::from_u32(cp).ok_or(DecodeError::InvalidCodePoint(cp))?);
        }
        Ok(WideString(chars))
    }

    fn key(&mut self) -> Result<KeyEvent, DecodeError> {
        let code = self.u32()?;
        let mask = KeyMask::from_bits_retain(self.u16()?);
        let layout = self.u32()?;
        Ok(KeyEvent { code, mask, layout })
    }

    fn attrs(&mut self) -> Result<Vec<Attribute>, DecodeError> {
        let n = self.count(13)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let start = self.u32()?;
            let length = self.u32()?;
            let kind = AttributeKind::from_u8(self.u8()?)?;
            let value = self.u32()?;
            out.push(Attribute {
                start,
                length,
                kind,
                value,
            });
        }
        Ok(out)
    }

    fn property(&mut self) -> Result<Property, DecodeError> {
        let key = self.string()?;
        let label = self.string()?;
        let icon = self.string()?;
        let tip = self.string()?;
        let flags = self.u8()?;
        Ok(Property {
            key,
            label,
            icon,
            tip,
            active: flags & 1 != 0,
            visible: flags & 2 != 0,
        })
    }

    fn table(&mut self) -> Result<LookupTable, DecodeError> {
        let page_size = self.u32()?;
        let cursor_pos = self.u32()?;
        let flags = self.u8()?;
        let n = self.count(4)?;
        let labels = (0..n).map(|_| self.wide()).collect::<Result<Vec<_>, _>>()?;
        let n = self.count(8)?;
        let mut candidates = Vec::with_capacity(n);
        for _ in 0..n {
            let text = self.wide()?;
            let attributes = self.attrs()?;
            candidates.push(Candidate { text, attributes });
        }
        Ok(LookupTable {
            page_size,
            cursor_pos,
            cursor_visible: flags & 1 != 0,
            page_up: flags & 2 != 0,
            page_down: flags & 4 != 0,
            labels,
            candidates,
        })
    }

    /// Walk every item of a nested transaction so malformed contents fail here, not on first read.
    fn check_nested(&self, inner: &[u8]) -> Result<(), DecodeError> {
        if self.depth >= MAX_NESTING {
            return Err(DecodeError::NestingTooDeep);
        }
        let mut pos = 0;
        while pos < inner.len() {
            let ty = peek_type(inner, pos)?;
            let mut r = Reader {
                buf: inner,
                pos: pos + 1,
                depth: self.depth + 1,
            };
            r.payload(ty)?;
            pos = r.pos;
        }
        Ok(())
    }

    fn payload(&mut self, ty: DataType) -> Result<Value, DecodeError> {
        Ok(match ty {
            DataType::Command => Value::Command(self.i32()?),
            DataType::UInt32 => Value::UInt32(self.u32()?),
            DataType::Int32 => Value::Int32(self.i32()?),
            DataType::Bool => Value::Bool(self.bool()?),
            DataType::Double => {
                let s = self.string()?;
                Value::Double(s.parse().map_err(|_| DecodeError::InvalidDouble)?)
            }
            DataType::String => Value::String(self.string()?),
            DataType::WideString => Value::WideString(self.wide()?),
            DataType::KeyEvent => Value::KeyEvent(self.key()?),
            DataType::AttributeList => Value::AttributeList(self.attrs()?),
            DataType::Property => Value::Property(self.property()?),
            DataType::PropertyList => {
                let n = self.count(17)?;
                Value::PropertyList((0..n).map(|_| self.property()).collect::<Result<_, _>>()?)
            }
            DataType::LookupTable => Value::LookupTable(self.table()?),
            DataType::VecUInt32 => {
                let n = self.count(4)?;
                Value::VecUInt32((0..n).map(|_| self.u32()).collect::<Result<_, _>>()?)
            }
            DataType::VecString => {
                let n = self.count(4)?;
                Value::VecString((0..n).map(|_| self.string()).collect::<Result<_, _>>()?)
            }
            DataType::VecWideString => {
                let n = self.count(4)?;
                Value::VecWideString((0..n).map(|_| self.wide()).collect::<Result<_, _>>()?)
            }
            DataType::Raw => Value::Raw(self.bytes()?.to_vec()),
            DataType::Transaction => {
                let inner = self.bytes()?;
                self.check_nested(inner)?;
                Value::Transaction(Transaction::from_bytes(inner))
            }
        })
    }
}

/// Read the tag at `cursor` without consuming anything.
pub fn peek_type(buf: &[u8], cursor: usize) -> Result<DataType, DecodeError> {
    let tag = *buf.get(cursor).ok_or(DecodeError::EndOfData)?;
    DataType::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))
}

/// Decode one tagged item at `cursor`. Returns the value and the cursor just past it.
pub fn decode(buf: &[u8], cursor: usize) -> Result<(Value, usize), DecodeError> {
    let ty = peek_type(buf, cursor)?;
    let mut r = Reader {
        buf,
        pos: cursor + 1,
        depth: 0,
    };
    let value = r.payload(ty)?;
    Ok((value, r.pos))
}

/// Decode one item, requiring it to carry tag `expected`.
pub fn decode_expecting(
    buf: &[u8],
    cursor: usize,
    expected: DataType,
) -> Result<(Value, usize), DecodeError> {
    let found = peek_type(buf, cursor)?;
    if found != expected {
        return Err(DecodeError::TypeMismatch { expected, found });
    }
    decode(buf, cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::keysym;
    use proptest::prelude::*;

    fn samples() -> Vec<Value> {
        let mut nested = Transaction::new();
        nested.put_command(9);
        nested.put_string("inner");
        vec![
            Value::Command(-3),
            Value::UInt32(u32::MAX),
            Value::Int32(i32::MIN),
            Value::Bool(true),
            Value::Bool(false),
            Value::Double(0.1),
            Value::Double(-1.5e300),
            Value::String(String::new()),
            Value::String("héllo".into()),
            Value::WideString(WideString::new()),
            Value::WideString("中文😀".into()),
            Value::KeyEvent(KeyEvent {
                code: keysym::SPACE,
                mask: KeyMask::CONTROL | KeyMask::RELEASE,
                layout: 3,
            }),
            Value::AttributeList(vec![]),
            Value::AttributeList(vec![
                Attribute::new(0, 2, AttributeKind::Decorate, DECORATE_UNDERLINE),
                Attribute::new(2, 1, AttributeKind::Foreground, 0x00ff_0000),
            ]),
            Value::Property(Property::new("/IMEngine/Mode", "中")),
            Value::PropertyList(vec![]),
            Value::PropertyList(vec![
                Property::new("/a", "A"),
                Property {
                    icon: "/usr/share/icon.png".into(),
                    tip: "tip".into(),
                    active: false,
                    ..Property::new("/b", "B")
                },
            ]),
            Value::LookupTable(LookupTable::default()),
            Value::LookupTable(LookupTable {
                page_size: 5,
                cursor_pos: 1,
                cursor_visible: true,
                page_up: false,
                page_down: true,
                labels: vec!["1".into(), "2".into()],
                candidates: vec![
                    Candidate {
                        text: "你".into(),
                        attributes: vec![],
                    },
                    Candidate {
                        text: "尼".into(),
                        attributes: vec![Attribute::new(0, 1, AttributeKind::Background, 7)],
                    },
                ],
            }),
            Value::VecUInt32(vec![]),
            Value::VecUInt32(vec![1, 2, 3]),
            Value::VecString(vec![String::new(), "x".into()]),
            Value::VecWideString(vec!["ab".into(), WideString::new()]),
            Value::Raw(vec![]),
            Value::Raw(vec![0, 255, 7]),
            Value::Transaction(Transaction::new()),
            Value::Transaction(nested),
        ]
    }

    #[test]
    fn roundtrip_every_kind() {
        for v in samples() {
            let mut buf = Vec::new();
            encode(&v, &mut buf);
            let (decoded, end) = decode(&buf, 0).unwrap();
            assert_eq!(end, buf.len(), "{:?}", v);
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn tag_precedes_payload() {
        let mut buf = Vec::new();
        encode(&Value::UInt32(0x0102_0304), &mut buf);
        assert_eq!(buf, vec![DataType::UInt32.tag(), 4, 3, 2, 1]);

        buf.clear();
        encode(&Value::KeyEvent(KeyEvent::new(0x61, KeyMask::CONTROL)), &mut buf);
        assert_eq!(buf.len(), 1 + 4 + 2 + 4);
    }

    #[test]
    fn string_framing() {
        let mut buf = Vec::new();
        encode(&Value::String("hi".into()), &mut buf);
        assert_eq!(buf, vec![DataType::String.tag(), 2, 0, 0, 0, b'h', b'i']);

        buf.clear();
        encode(&Value::WideString(WideString(vec!['\u{4E2D}'])), &mut buf);
        assert_eq!(buf, vec![DataType::WideString.tag(), 1, 0, 0, 0, 0x2d, 0x4e, 0, 0]);
    }

    #[test]
    fn unknown_tag_fails() {
        assert_eq!(decode(&[0xee, 0, 0, 0, 0], 0), Err(DecodeError::UnknownTag(0xee)));
        assert_eq!(decode(&[0], 0), Err(DecodeError::UnknownTag(0)));
    }

    #[test]
    fn empty_buffer_is_end_of_data() {
        assert_eq!(decode(&[], 0), Err(DecodeError::EndOfData));
    }

    #[test]
    fn invalid_payloads_fail() {
        let bad_bool = [DataType::Bool.tag(), 2];
        assert_eq!(decode(&bad_bool, 0), Err(DecodeError::InvalidBool(2)));

        let bad_utf8 = [DataType::String.tag(), 1, 0, 0, 0, 0xff];
        assert_eq!(decode(&bad_utf8, 0), Err(DecodeError::InvalidUtf8));

        let surrogate = [DataType::WideString.tag(), 1, 0, 0, 0, 0x00, 0xd8, 0, 0];
        assert_eq!(decode(&surrogate, 0), Err(DecodeError::InvalidCodePoint(0xd800)));

        let bad_double = [DataType::Double.tag(), 1, 0, 0, 0, b'x'];
        assert_eq!(decode(&bad_double, 0), Err(DecodeError::InvalidDouble));
    }

    #[test]
    fn malformed_nested_transaction_fails_at_decode() {
        let inner = [0xee, 0, 0, 0, 0];
        let mut buf = vec![DataType::Transaction.tag()];
        buf.extend_from_slice(&(inner.len() as u32).to_le_bytes());
        buf.extend_from_slice(&inner);
        assert_eq!(decode(&buf, 0), Err(DecodeError::UnknownTag(0xee)));

        let truncated_inner = [DataType::UInt32.tag(), 1, 2];
        let mut buf = vec![DataType::Transaction.tag()];
        buf.extend_from_slice(&(truncated_inner.len() as u32).to_le_bytes());
        buf.extend_from_slice(&truncated_inner);
        assert!(matches!(decode(&buf, 0), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let wrap = |levels: usize| {
            let mut t = Transaction::new();
            t.put_uint32(1);
            for _ in 0..levels {
                let mut outer = Transaction::new();
                outer.put_transaction(&t);
                t = outer;
            }
            let mut buf = Vec::new();
            encode(&Value::Transaction(t), &mut buf);
            buf
        };
        assert!(decode(&wrap(MAX_NESTING - 1), 0).is_ok());
        assert_eq!(decode(&wrap(MAX_NESTING + 1), 0), Err(DecodeError::NestingTooDeep));
    }

    #[test]
    fn huge_count_rejected_before_allocating() {
        let buf = [DataType::VecUInt32.tag(), 0xff, 0xff, 0xff, 0xff, 1, 2, 3, 4];
        assert!(matches!(decode(&buf, 0), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn mismatch_reports_both_types() {
        let mut buf = Vec::new();
        encode(&Value::String("x".into()), &mut buf);
        assert_eq!(
            decode_expecting(&buf, 0, DataType::UInt32),
            Err(DecodeError::TypeMismatch {
                expected: DataType::UInt32,
                found: DataType::String
            })
        );
    }

    proptest! {
        #[test]
        fn truncation_always_fails_cleanly(idx in any::<prop::sample::Index>(), cut_frac in 0.0f64..1.0) {
            let all = samples();
            let v = idx.get(&all);
            let mut buf = Vec::new();
            encode(v, &mut buf);
            let cut = ((buf.len() as f64) * cut_frac) as usize;
            prop_assume!(cut < buf.len());
            prop_assert!(decode(&buf[..cut], 0).is_err());
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode(&bytes, 0);
        }

        #[test]
        fn strings_roundtrip(s in ".*") {
            let mut buf = Vec::new();
            encode(&Value::String(s.clone()), &mut buf);
            encode(&Value::WideString(s.as_str().into()), &mut buf);
            let (a, next) = decode(&buf, 0).unwrap();
            let (b, end) = decode(&buf, next).unwrap();
            prop_assert_eq!(end, buf.len());
            prop_assert_eq!(a, Value::String(s.clone()));
            prop_assert_eq!(b, Value::WideString(s.as_str().into()));
        }
    }

    #[test]
    fn truncation_at_every_offset() {
        for v in samples() {
            let mut buf = Vec::new();
            encode(&v, &mut buf);
            for cut in 0..buf.len() {
                assert!(decode(&buf[..cut], 0).is_err(), "{:?} cut at {}", v, cut);
            }
        }
    }
}
