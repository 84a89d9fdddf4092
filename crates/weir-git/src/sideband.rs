//! Side-band multiplexing of the server's output stream.
//!
//! With side-band negotiated, one byte stream carries three logical channels:
//! band 1 for protocol data, band 2 for progress text and band 3 for fatal
//! errors. Each frame is a pkt-line whose first payload byte names the band.
//! Without side-band, data goes straight to the stream, progress goes to an
//! optional message sink, and errors go to the sink or inline as an `ERR`
//! pkt-line. [`Channels`] hides that difference from the session.

use crate::pktline::{PktLine, PktLineWriter};
use crate::Result;
use std::fmt;
use std::io::Write;

/// Frame size of the original `side-band` capability, prefix included.
pub const SMALL_FRAME_LEN: usize = 1000;

/// A side-band channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Band {
    /// Protocol data (status report).
    Data = 1,
    /// Human-readable progress.
    Progress = 2,
    /// Fatal error text.
    Error = 3,
}

impl Band {
    /// Parses a band marker byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Progress),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Where out-of-band messages go when side-band is off (stderr for an SSH
/// transport, nothing for a bare socket).
pub type MessageSink = Box<dyn Write + Send>;

/// The session's output, with or without side-band framing.
pub struct Channels<W: Write> {
    out: PktLineWriter<W>,
    mode: Mode,
    quiet: bool,
}

enum Mode {
    SideBand { frame_len: usize },
    Inline { messages: Option<MessageSink> },
}

impl<W: Write> fmt::Debug for Channels<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.mode {
            Mode::SideBand { frame_len } => format!("side-band({})", frame_len),
            Mode::Inline { messages } => format!("inline(sink={})", messages.is_some()),
        };
        f.debug_struct("Channels")
            .field("mode", &mode)
            .field("quiet", &self.quiet)
            .finish()
    }
}

impl<W: Write> Channels<W> {
    /// Creates inline channels over a raw stream.
    pub fn inline(out: W, messages: Option<MessageSink>) -> Self {
        Self {
            out: PktLineWriter::new(out),
            mode: Mode::Inline { messages },
            quiet: false,
        }
    }

    /// Switches to side-band framing with the given frame size.
    ///
    /// Any inline message sink is dropped: from here on messages travel in
    /// band 2 and band 3.
    pub fn enable_side_band(&mut self, frame_len: usize) {
        self.mode = Mode::SideBand { frame_len };
    }

    /// Suppresses progress messages.
    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    /// Returns true if side-band framing is active.
    pub fn is_side_band(&self) -> bool {
        matches!(self.mode, Mode::SideBand { .. })
    }

    /// Direct pkt-line access for output written before negotiation.
    pub fn raw(&mut self) -> &mut PktLineWriter<W> {
        &mut self.out
    }

    /// Writes protocol data on the primary channel.
    pub fn data(&mut self, data: &[u8]) -> Result<()> {
        match self.mode {
            Mode::SideBand { frame_len } => self.write_band(Band::Data, data, frame_len),
            Mode::Inline { .. } => {
                self.out.inner_mut().write_all(data)?;
                Ok(())
            }
        }
    }

    /// Writes a progress message. Dropped when quiet or when there is
    /// nowhere to put it.
    pub fn progress(&mut self, msg: &str) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        let msg = with_newline(msg);
        if let Mode::SideBand { frame_len } = self.mode {
            return self.write_band(Band::Progress, msg.as_bytes(), frame_len);
        }
        if let Mode::Inline {
            messages: Some(sink),
        } = &mut self.mode
        {
            // Best effort: a broken message sink must not fail the push.
            let _ = sink.write_all(msg.as_bytes());
        }
        Ok(())
    }

    /// Writes a fatal error message. Never suppressed by quiet mode.
    pub fn error(&mut self, msg: &str) -> Result<()> {
        let msg = with_newline(msg);
        if let Mode::SideBand { frame_len } = self.mode {
            return self.write_band(Band::Error, msg.as_bytes(), frame_len);
        }
        match &mut self.mode {
            Mode::SideBand { .. } => Ok(()),
            Mode::Inline {
                messages: Some(sink),
            } => {
                let _ = sink.write_all(format!("error: {}", msg).as_bytes());
                Ok(())
            }
            Mode::Inline { messages: None } => self.out.write_line(&format!("ERR {}", msg)),
        }
    }

    /// Flushes every channel and, with side-band, ends the stream with a
    /// flush pkt.
    pub fn finish(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::SideBand { .. } => self.out.flush_pkt()?,
            Mode::Inline { messages } => {
                if let Some(sink) = messages {
                    let _ = sink.flush();
                }
            }
        }
        self.out.flush()
    }

    /// Consumes the channels and returns the raw stream.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn write_band(&mut self, band: Band, data: &[u8], frame_len: usize) -> Result<()> {
        // 4 bytes of length prefix and 1 band byte per frame.
        let max_payload = frame_len - 5;
        for chunk in data.chunks(max_payload) {
            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(band as u8);
            frame.extend_from_slice(chunk);
            self.out.write(&PktLine::Data(frame))?;
        }
        self.out.flush()
    }
}

fn with_newline(msg: &str) -> String {
    if msg.ends_with('\n') {
        msg.to_string()
    } else {
        format!("{}\n", msg)
    }
}

/// Splits side-band framed output back into its channels. Used by clients
/// and tests.
pub fn demux(mut input: &[u8]) -> Result<Demuxed> {
    let mut reader = crate::pktline::PktLineReader::new(&mut input);
    let mut out = Demuxed::default();
    while let Some(pkt) = reader.read()? {
        match pkt {
            PktLine::Flush => out.flushed = true,
            PktLine::Data(data) => {
                let (band, payload) = data
                    .split_first()
                    .ok_or_else(|| crate::GitError::protocol("empty side-band frame"))?;
                match Band::from_byte(*band) {
                    Some(Band::Data) => out.data.extend_from_slice(payload),
                    Some(Band::Progress) => out.progress.extend_from_slice(payload),
                    Some(Band::Error) => out.error.extend_from_slice(payload),
                    None => {
                        return Err(crate::GitError::protocol(format!(
                            "unknown side-band {}",
                            band
                        )))
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Output of [`demux`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demuxed {
    /// Band 1 payload.
    pub data: Vec<u8>,
    /// Band 2 payload.
    pub progress: Vec<u8>,
    /// Band 3 payload.
    pub error: Vec<u8>,
    /// A flush pkt was seen on the outer stream.
    pub flushed: bool,
}
