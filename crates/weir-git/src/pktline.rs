//! pkt-line framing.
//!
//! Every line on the wire carries a four digit hex length that counts the
//! prefix itself. `0000` is the flush sentinel that ends a list; lengths
//! `0001` to `0003` are never valid.

use crate::{GitError, Result};
use std::io::{ErrorKind, Read, Write};

/// Largest pkt-line allowed on the wire, length prefix included.
pub const MAX_PKT_LEN: usize = 65520;

const PREFIX_LEN: usize = 4;
const FLUSH: &[u8; PREFIX_LEN] = b"0000";

/// One frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Payload, without the length prefix.
    Data(Vec<u8>),
    /// `0000`.
    Flush,
}

impl PktLine {
    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Data(data) => PREFIX_LEN + data.len(),
            Self::Flush => PREFIX_LEN,
        }
    }

    /// Wire bytes of the frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let mut out = Vec::with_capacity(self.encoded_len());
                out.extend_from_slice(format!("{:04x}", self.encoded_len()).as_bytes());
                out.extend_from_slice(data);
                out
            }
            Self::Flush => FLUSH.to_vec(),
        }
    }

    /// Payload; `None` for a flush.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            Self::Flush => None,
        }
    }

    /// Payload as text without its line feed; `None` for a flush or
    /// non-UTF-8 payload.
    pub fn as_str(&self) -> Option<&str> {
        let text = std::str::from_utf8(self.data()?).ok()?;
        Some(text.strip_suffix('\n').unwrap_or(text))
    }
}

impl From<&str> for PktLine {
    fn from(text: &str) -> Self {
        Self::Data(text.as_bytes().to_vec())
    }
}

/// Decodes a length prefix. `Ok(None)` is the flush sentinel.
fn decode_len(prefix: &[u8; PREFIX_LEN]) -> Result<Option<usize>> {
    if prefix == FLUSH {
        return Ok(None);
    }
    let len = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            GitError::InvalidPktLine(format!(
                "bad length prefix {:?}",
                String::from_utf8_lossy(prefix)
            ))
        })?;
    match len {
        1..=3 => Err(GitError::InvalidPktLine(format!("reserved length {len}"))),
        l if l > MAX_PKT_LEN => Err(GitError::InvalidPktLine(format!(
            "length {l} exceeds {MAX_PKT_LEN}"
        ))),
        l => Ok(Some(l - PREFIX_LEN)),
    }
}

/// Reads frames from an unbuffered source.
///
/// Nothing past the current frame is consumed, so the pack that follows the
/// command list can be read straight from [`inner_mut`](Self::inner_mut).
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Wraps `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next frame, or `None` when the input ends on a frame boundary.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut prefix = [0u8; PREFIX_LEN];
        if let Err(e) = self.reader.read_exact(&mut prefix) {
            return match e.kind() {
                ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(e.into()),
            };
        }
        let Some(len) = decode_len(&prefix)? else {
            return Ok(Some(PktLine::Flush));
        };
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        Ok(Some(PktLine::Data(data)))
    }

    /// Next text line without its line feed.
    ///
    /// `None` for the flush sentinel and at end of input alike. A payload that
    /// is not UTF-8 is an error.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let Some(PktLine::Data(mut data)) = self.read()? else {
            return Ok(None);
        };
        if data.last() == Some(&b'\n') {
            data.pop();
        }
        String::from_utf8(data)
            .map(Some)
            .map_err(|_| GitError::InvalidPktLine("line is not UTF-8".to_string()))
    }

    /// The wrapped source.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

/// Writes frames.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one frame. Oversized payloads are refused before anything is
    /// written.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if pkt.encoded_len() > MAX_PKT_LEN {
            return Err(GitError::InvalidPktLine(format!(
                "{} byte frame exceeds {MAX_PKT_LEN}",
                pkt.encoded_len()
            )));
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes raw payload bytes.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a text line, adding the line feed if missing.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes `0000`.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer. Writes no frame.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// The wrapped sink, for writing raw bytes between frames.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Unwraps the sink. Frames already written are not flushed.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Encodes text lines followed by a flush.
pub fn encode_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Vec<u8>> {
    let mut writer = PktLineWriter::new(Vec::new());
    for line in lines {
        writer.write_line(line)?;
    }
    writer.flush_pkt()?;
    Ok(writer.into_inner())
}
