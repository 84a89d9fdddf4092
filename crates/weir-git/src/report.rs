//! Per-ref status reporting.
//!
//! A client that negotiated `report-status` gets machine-readable pkt-lines
//! on the data channel:
//!
//! ```text
//! unpack ok
//! ok refs/heads/main
//! ng refs/heads/topic non-fast forward
//! ```
//!
//! Any other client gets one `! [rejected]` progress line per failed ref.

use crate::command::{CommandResult, ReceiveCommand};
use crate::pktline::encode_lines;
use crate::sideband::Channels;
use crate::Result;
use std::io::Write;

/// Reason reported for every ref when the pack could not be unpacked.
pub const UNPACKER_ERROR: &str = "n/a (unpacker error)";

/// Reason given to commands nothing ever decided.
pub const NOT_PROCESSED: &str = "server bug; ref not processed";

/// Fails every command that is still undecided.
pub fn fail_unprocessed(commands: &mut [ReceiveCommand]) {
    for cmd in commands
        .iter_mut()
        .filter(|c| c.result() == CommandResult::NotAttempted)
    {
        tracing::warn!(ref_name = %cmd.ref_name(), "command left unprocessed");
        cmd.reject(NOT_PROCESSED);
    }
}

/// Outcome of a session as reported to the client.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport<'a> {
    unpack_error: Option<&'a str>,
    commands: &'a [ReceiveCommand],
}

impl<'a> StatusReport<'a> {
    /// Reports on `commands`, in the order they were received.
    pub fn new(commands: &'a [ReceiveCommand]) -> Self {
        Self {
            unpack_error: None,
            commands,
        }
    }

    /// Records that the pack failed to unpack.
    pub fn unpack_error(mut self, error: Option<&'a str>) -> Self {
        self.unpack_error = error;
        self
    }

    /// The `report-status` lines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.commands.len() + 1);
        match self.unpack_error {
            None => lines.push("unpack ok".to_string()),
            Some(error) => lines.push(format!("unpack error {}", single_line(error))),
        }
        for cmd in self.commands {
            if self.unpack_error.is_some() {
                lines.push(format!("ng {} {}", cmd.ref_name(), UNPACKER_ERROR));
            } else if cmd.result() == CommandResult::Ok {
                lines.push(format!("ok {}", cmd.ref_name()));
            } else {
                lines.push(format!("ng {} {}", cmd.ref_name(), cmd.reason()));
            }
        }
        lines
    }

    /// Progress lines for clients without `report-status`. Successful refs
    /// are not mentioned.
    pub fn human_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(error) = self.unpack_error {
            lines.push(format!("error: unpack failed: {}", single_line(error)));
        }
        for cmd in self.commands {
            if self.unpack_error.is_some() {
                lines.push(format!("! [rejected] {} ({})", cmd.ref_name(), UNPACKER_ERROR));
            } else if cmd.result() != CommandResult::Ok {
                lines.push(format!("! [rejected] {} ({})", cmd.ref_name(), cmd.reason()));
            }
        }
        lines
    }

    /// Sends the report in the form the client asked for.
    pub fn send<W: Write>(&self, channels: &mut Channels<W>, report_status: bool) -> Result<()> {
        if report_status {
            let lines = self.lines();
            let buf = encode_lines(lines.iter().map(String::as_str))?;
            channels.data(&buf)
        } else {
            for line in self.human_lines() {
                channels.progress(&line)?;
            }
            Ok(())
        }
    }
}

fn single_line(msg: &str) -> String {
    msg.replace('\n', " ")
}
