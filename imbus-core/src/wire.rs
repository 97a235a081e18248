//! Framing: optional 4-byte signature (LE) + 4-byte length (LE) + transaction bytes.

const LEN_SIZE: usize = 4;
const SIGNATURE_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Size of the frame header for the given signature choice.
pub fn header_len(signature: Option<u32>) -> usize {
    LEN_SIZE + signature.map_or(0, |_| SIGNATURE_SIZE)
}

/// Append one frame carrying `payload` to `out`.
pub fn encode_frame(
    payload: &[u8],
    signature: Option<u32>,
    out: &mut Vec<u8>,
) -> Result<(), FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.reserve(header_len(signature) + payload.len());
    if let Some(sig) = signature {
        out.extend_from_slice(&sig.to_le_bytes());
    }
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Parse the frame header at the front of `bytes`. Returns the payload length.
pub fn decode_header(bytes: &[u8], signature: Option<u32>) -> Result<usize, FrameDecodeError> {
    let header = header_len(signature);
    if bytes.len() < header {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut at = 0;
    if let Some(expected) = signature {
        let found = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if found != expected {
            return Err(FrameDecodeError::BadSignature { expected, found });
        }
        at = SIGNATURE_SIZE;
    }
    let len = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes yet.
pub fn decode_frame(bytes: &[u8], signature: Option<u32>) -> Result<(&[u8], usize), FrameDecodeError> {
    let len = decode_header(bytes, signature)?;
    let start = header_len(signature);
    if bytes.len() < start + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[start..start + len], start + len))
}

/// Error decoding a frame (need more bytes, too large, or wrong signature).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("bad signature: expected {expected:#010x}, found {found:#010x}")]
    BadSignature { expected: u32, found: u32 },
}

/// Accumulates bytes from non-blocking reads and splits out complete frame payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    signature: Option<u32>,
}

impl FrameDecoder {
    pub fn new(signature: Option<u32>) -> Self {
        Self {
            buf: Vec::new(),
            signature,
        }
    }

    /// Append received bytes and return every payload now complete.
    /// A framing error poisons the stream; the caller should drop the connection.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, FrameDecodeError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            match decode_frame(&self.buf[consumed..], self.signature) {
                Ok((payload, n)) => {
                    frames.push(payload.to_vec());
                    consumed += n;
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(e),
            }
        }
        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
