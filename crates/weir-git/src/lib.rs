//! Push-receive protocol engine for Weir.
//!
//! This crate implements the server side of `git push`: it advertises refs,
//! negotiates capabilities, reads the client's ref update commands, receives
//! and checks the accompanying pack, verifies that the pushed graph is
//! connected, and applies the accepted updates as one batch before reporting
//! per-ref status.
//!
//! The entry point is [`ReceivePack`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use weir_git::{ReceiveConfig, ReceivePack};
//! use weir_storage::Repository;
//!
//! # fn serve(input: std::net::TcpStream) -> weir_git::Result<()> {
//! let repo = Arc::new(Repository::new("project.git"));
//! let mut session = ReceivePack::new(repo, ReceiveConfig::default());
//! session.send_advertisement(&input)?;
//! let outcome = session.receive(&input, &input, None)?;
//! println!("{} refs updated", outcome.commands.len());
//! # Ok(())
//! # }
//! ```

mod advertise;
mod apply;
mod capability;
mod certificate;
mod command;
mod config;
mod connectivity;
mod delta;
mod error;
mod fsck;
mod pack;
mod pktline;
mod report;
mod session;
mod sideband;
mod validate;

pub use advertise::AdvertisedRefs;
pub use apply::{BatchRefUpdate, REFLOG_MESSAGE, TRANSACTION_ABORTED};
pub use capability::{advertised, server_agent, CapabilitySet, FirstLine, Negotiated};
pub use certificate::{NonceGenerator, NonceStatus, PushCertificate, PushCertificateParser};
pub use command::{is_valid_ref_name, CommandResult, CommandType, ReceiveCommand};
pub use config::ReceiveConfig;
pub use connectivity::ConnectivityChecker;
pub use delta::{apply_delta, DeltaBuilder};
pub use error::GitError;
pub use fsck::ObjectChecker;
pub use pack::{PackBuilder, PackParser, ReceivedPack};
pub use pktline::{encode_lines, PktLine, PktLineReader, PktLineWriter, MAX_PKT_LEN};
pub use report::{fail_unprocessed, StatusReport, NOT_PROCESSED, UNPACKER_ERROR};
pub use session::{ReceiveOutcome, ReceivePack, TimeoutControl};
pub use sideband::{demux, Band, Channels, Demuxed, MessageSink, SMALL_FRAME_LEN};
pub use validate::{is_ancestor, CommandValidator};

/// Capability names understood by the server.
pub mod capabilities {
    pub use crate::capability::{
        AGENT, ATOMIC, DELETE_REFS, OFS_DELTA, PUSH_CERT, PUSH_OPTIONS, QUIET, REPORT_STATUS,
        SIDE_BAND, SIDE_BAND_64K,
    };
}

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
