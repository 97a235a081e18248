//! Transaction: an appendable, re-readable stream of tagged values, framed for the wire.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::key::KeyEvent;
use crate::socket::TimedStream;
use crate::value::{
    self, Attribute, DataType, DecodeError, LookupTable, Property, Value, WideString,
};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Ordered sequence of commands and values. Appends only move the write end; reads move an
/// independent cursor and leave it untouched when they fail.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    buf: Vec<u8>,
    read_pos: usize,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

/// Error moving a transaction across a stream.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for transaction")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("framing error: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
}

macro_rules! getters {
    ($($(#[$doc:meta])* $name:ident => $variant:ident($ty:ty);)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self) -> Result<$ty, DecodeError> {
                match self.get_typed(DataType::$variant)? {
                    Value::$variant(v) => Ok(v),
                    other => Err(DecodeError::TypeMismatch {
                        expected: DataType::$variant,
                        found: other.data_type(),
                    }),
                }
            }
        )*
    };
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already encoded item stream. The read cursor starts at the beginning.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            read_pos: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not yet consumed by the read cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.read_pos = 0;
    }

    /// Move the read cursor back to the first item.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    // ---- writing ----

    pub fn put(&mut self, value: &Value) {
        value::encode(value, &mut self.buf);
    }

    pub fn put_command(&mut self, cmd: i32) {
        self.put(&Value::Command(cmd));
    }

    pub fn put_uint32(&mut self, v: u32) {
        self.put(&Value::UInt32(v));
    }

    pub fn put_int32(&mut self, v: i32) {
        self.put(&Value::Int32(v));
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put(&Value::Bool(v));
    }

    pub fn put_double(&mut self, v: f64) {
        self.put(&Value::Double(v));
    }

    pub fn put_string(&mut self, s: &str) {
        self.put(&Value::String(s.to_string()));
    }

    pub fn put_wide_string(&mut self, s: &WideString) {
        self.put(&Value::WideString(s.clone()));
    }

    pub fn put_key_event(&mut self, key: &KeyEvent) {
        self.put(&Value::KeyEvent(*key));
    }

    pub fn put_attribute_list(&mut self, attrs: &[Attribute]) {
        self.put(&Value::AttributeList(attrs.to_vec()));
    }

    pub fn put_property(&mut self, prop: &Property) {
        self.put(&Value::Property(prop.clone()));
    }

    pub fn put_property_list(&mut self, props: &[Property]) {
        self.put(&Value::PropertyList(props.to_vec()));
    }

    pub fn put_lookup_table(&mut self, table: &LookupTable) {
        self.put(&Value::LookupTable(table.clone()));
    }

    pub fn put_vec_uint32(&mut self, v: &[u32]) {
        self.put(&Value::VecUInt32(v.to_vec()));
    }

    pub fn put_vec_string(&mut self, v: &[String]) {
        self.put(&Value::VecString(v.to_vec()));
    }

    pub fn put_vec_wide_string(&mut self, v: &[WideString]) {
        self.put(&Value::VecWideString(v.to_vec()));
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.put(&Value::Raw(bytes.to_vec()));
    }

    /// Embed `inner` as one item. Its read cursor is not carried.
    pub fn put_transaction(&mut self, inner: &Transaction) {
        self.put(&Value::Transaction(Transaction::from_bytes(&inner.buf)));
    }

    // ---- reading ----

    /// Type of the item at the cursor, if any.
    pub fn peek_type(&self) -> Result<DataType, DecodeError> {
        value::peek_type(&self.buf, self.read_pos)
    }

    /// Command at the cursor without consuming it.
    pub fn peek_command(&self) -> Option<i32> {
        match value::decode_expecting(&self.buf, self.read_pos, DataType::Command) {
            Ok((Value::Command(c), _)) => Some(c),
            _ => None,
        }
    }

    /// Decode the next item whatever its type.
    pub fn get_value(&mut self) -> Result<Value, DecodeError> {
        let (v, next) = value::decode(&self.buf, self.read_pos)?;
        self.read_pos = next;
        Ok(v)
    }

    /// Step over the next item. Fails without moving if it is malformed.
    pub fn skip(&mut self) -> Result<DataType, DecodeError> {
        self.get_value().map(|v| v.data_type())
    }

    fn get_typed(&mut self, expected: DataType) -> Result<Value, DecodeError> {
        let (v, next) = value::decode_expecting(&self.buf, self.read_pos, expected)?;
        self.read_pos = next;
        Ok(v)
    }

    getters! {
        get_command => Command(i32);
        get_uint32 => UInt32(u32);
        get_int32 => Int32(i32);
        get_bool => Bool(bool);
        get_double => Double(f64);
        get_string => String(String);
        get_wide_string => WideString(WideString);
        get_key_event => KeyEvent(KeyEvent);
        get_attribute_list => AttributeList(Vec<Attribute>);
        get_property => Property(Property);
        get_property_list => PropertyList(Vec<Property>);
        get_lookup_table => LookupTable(LookupTable);
        get_vec_uint32 => VecUInt32(Vec<u32>);
        get_vec_string => VecString(Vec<String>);
        get_vec_wide_string => VecWideString(Vec<WideString>);
        get_raw => Raw(Vec<u8>);
        /// Nested transaction, with its own cursor at the start.
        get_transaction => Transaction(Transaction);
    }

    // ---- framing ----

    /// Append this transaction as one frame to `out`.
    pub fn write_to_buffer(
        &self,
        out: &mut Vec<u8>,
        signature: Option<u32>,
    ) -> Result<(), FrameEncodeError> {
        wire::encode_frame(&self.buf, signature, out)
    }

    /// Replace contents with the frame at the front of `bytes`; returns bytes consumed.
    pub fn read_from_buffer(
        &mut self,
        bytes: &[u8],
        signature: Option<u32>,
    ) -> Result<usize, FrameDecodeError> {
        let (payload, n) = wire::decode_frame(bytes, signature)?;
        self.buf.clear();
        self.buf.extend_from_slice(payload);
        self.read_pos = 0;
        Ok(n)
    }

    /// Write signature, length and body to `w` in one go.
    pub fn write_to<W: Write>(&self, w: &mut W, signature: Option<u32>) -> Result<(), TransactionError> {
        let mut frame = Vec::new();
        self.write_to_buffer(&mut frame, signature)?;
        w.write_all(&frame)?;
        w.flush()?;
        Ok(())
    }

    /// Block up to `timeout` for one complete frame and replace contents with it.
    /// On failure the previous contents are kept.
    pub fn read_from<S: TimedStream>(
        &mut self,
        stream: &mut S,
        signature: Option<u32>,
        timeout: Duration,
    ) -> Result<(), TransactionError> {
        let deadline = Instant::now() + timeout;
        let result = read_frame(stream, signature, deadline);
        stream.set_read_timeout(None)?;
        self.buf = result?;
        self.read_pos = 0;
        Ok(())
    }
}

fn read_frame<S: TimedStream>(
    stream: &mut S,
    signature: Option<u32>,
    deadline: Instant,
) -> Result<Vec<u8>, TransactionError> {
    let mut header = vec![0u8; wire::header_len(signature)];
    read_exact_until(stream, &mut header, deadline)?;
    let len = wire::decode_header(&header, signature)?;
    let mut body = vec![0u8; len];
    read_exact_until(stream, &mut body, deadline)?;
    Ok(body)
}

fn read_exact_until<S: TimedStream>(
    stream: &mut S,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), TransactionError> {
    let mut filled = 0;
    while filled < buf.len() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(TransactionError::Timeout);
        }
        stream.set_read_timeout(Some(left))?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransactionError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
