//! The receive-pack session.
//!
//! One [`ReceivePack`] serves one push:
//!
//! 1. advertise refs and capabilities ([`ReceivePack::send_advertisement`]);
//! 2. read shallow lines, the command list, an optional push certificate and
//!    push options;
//! 3. receive the pack, if any command needs one;
//! 4. check connectivity of the pushed graph;
//! 5. validate the commands against the advertised refs and the policy;
//! 6. apply the surviving commands as one batch;
//! 7. report per-ref status.
//!
//! Errors in steps 2 to 4 are fatal to the session. Steps 5 and 6 only ever
//! record verdicts on individual commands.

use crate::advertise::AdvertisedRefs;
use crate::apply::BatchRefUpdate;
use crate::capability::{advertised, FirstLine, Negotiated};
use crate::certificate::{
    NonceGenerator, PushCertificate, PushCertificateParser, BEGIN_CERTIFICATE, BEGIN_SIGNATURE,
};
use crate::command::{CommandResult, ReceiveCommand};
use crate::config::ReceiveConfig;
use crate::connectivity::ConnectivityChecker;
use crate::fsck::ObjectChecker;
use crate::pack::PackParser;
use crate::pktline::{PktLineReader, PktLineWriter};
use crate::report::{fail_unprocessed, StatusReport};
use crate::sideband::{Channels, MessageSink};
use crate::validate::CommandValidator;
use crate::{GitError, Result};
use std::collections::{BTreeSet, HashSet};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use weir_storage::{ObjectId, PackLock, Repository};

/// Longest wait for more input while a broken request is discarded.
const DISCARD_WAIT: Duration = Duration::from_millis(50);

/// Access to the timeouts of the transport a session runs on.
pub trait TimeoutControl: Send {
    /// Current timeout; `None` blocks forever.
    fn timeout(&self) -> io::Result<Option<Duration>>;

    /// Replaces the timeout.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl TimeoutControl for TcpStream {
    fn timeout(&self) -> io::Result<Option<Duration>> {
        self.read_timeout()
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

/// What the client sent before the pack.
#[derive(Debug)]
struct Request {
    negotiated: Negotiated,
    commands: Vec<ReceiveCommand>,
    shallow: BTreeSet<ObjectId>,
    certificate: Option<PushCertificate>,
    push_options: Vec<String>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            negotiated: Negotiated::none(),
            commands: Vec::new(),
            shallow: BTreeSet::new(),
            certificate: None,
            push_options: Vec::new(),
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    /// Every command, in the order received, with its final verdict.
    pub commands: Vec<ReceiveCommand>,
    /// Push options sent by the client.
    pub push_options: Vec<String>,
    /// The push certificate, if one was sent.
    pub certificate: Option<PushCertificate>,
}

impl ReceiveOutcome {
    /// Returns true if every command was applied.
    pub fn all_ok(&self) -> bool {
        self.commands.iter().all(|c| c.result() == CommandResult::Ok)
    }
}

/// Server side of one push.
pub struct ReceivePack {
    repo: Arc<Repository>,
    config: ReceiveConfig,
    advertised: Option<AdvertisedRefs>,
    nonces: Option<NonceGenerator>,
    sent_nonce: Option<String>,
    timeouts: Option<Box<dyn TimeoutControl>>,
}

impl std::fmt::Debug for ReceivePack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePack")
            .field("repo", &self.repo.name)
            .field("config", &self.config)
            .field("advertised", &self.advertised.as_ref().map(AdvertisedRefs::len))
            .field("sent_nonce", &self.sent_nonce)
            .field("timeouts", &self.timeouts.is_some())
            .finish()
    }
}

impl ReceivePack {
    /// Creates a session for `repo`.
    pub fn new(repo: Arc<Repository>, config: ReceiveConfig) -> Self {
        let nonces = config
            .certificate_nonce_seed
            .as_ref()
            .map(|seed| NonceGenerator::new(seed.clone(), config.nonce_slop_secs));
        Self {
            repo,
            config,
            advertised: None,
            nonces,
            sent_nonce: None,
            timeouts: None,
        }
    }

    /// Lets the session adjust transport timeouts.
    pub fn timeout_control(mut self, control: Box<dyn TimeoutControl>) -> Self {
        self.timeouts = Some(control);
        self
    }

    /// The receive policy.
    pub fn config(&self) -> &ReceiveConfig {
        &self.config
    }

    /// Snapshots the refs and writes the advertisement.
    ///
    /// Sessions that skip the advertisement (a client that already knows the
    /// refs) take the snapshot when [`receive`](Self::receive) starts.
    pub fn send_advertisement<W: Write>(&mut self, output: W) -> Result<()> {
        let refs = AdvertisedRefs::from_repository(&self.repo);
        self.sent_nonce = self
            .nonces
            .as_ref()
            .map(|nonces| nonces.create_nonce(&self.repo.name, unix_now()));
        let caps = advertised(
            &self.config,
            self.repo.supports_atomic(),
            self.sent_nonce.as_deref(),
        );
        refs.write(&mut PktLineWriter::new(output), &caps)?;
        tracing::debug!(repo = %self.repo.name, refs = refs.len(), "refs advertised");
        self.advertised = Some(refs);
        Ok(())
    }

    /// Runs the rest of the session: reads the request from `input` and
    /// writes the outcome to `output`.
    ///
    /// `messages` receives progress and error text when the client did not
    /// negotiate side-band.
    pub fn receive<R: Read, W: Write>(
        &mut self,
        input: R,
        output: W,
        messages: Option<MessageSink>,
    ) -> Result<ReceiveOutcome> {
        let advertised = match self.advertised.take() {
            Some(refs) => refs,
            None => AdvertisedRefs::from_repository(&self.repo),
        };
        let mut reader = PktLineReader::new(input);
        let mut channels = Channels::inline(output, messages);

        if let Some(timeout) = self.config.timeout() {
            self.set_timeout(Some(timeout))?;
        }

        let request = match self.recv_commands(&mut reader, &mut channels) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(repo = %self.repo.name, error = %e, "bad request");
                if !matches!(e, GitError::Io(_)) {
                    if channels.is_side_band() {
                        self.discard_pending(reader.inner_mut());
                    }
                    let sent = channels
                        .error(&e.to_string())
                        .and_then(|()| channels.finish());
                    if let Err(send_err) = sent {
                        tracing::debug!(error = %send_err, "could not send error to client");
                    }
                }
                return Err(e);
            }
        };
        let Request {
            negotiated,
            mut commands,
            shallow,
            certificate,
            push_options,
        } = request;

        if commands.is_empty() {
            tracing::debug!(repo = %self.repo.name, "empty push");
            return Ok(ReceiveOutcome {
                commands,
                push_options,
                certificate,
            });
        }

        let mut lock = None;
        let mut unpack_error = None;
        if commands.iter().any(|c| !c.is_delete()) {
            match self.unpack(&mut reader, &negotiated, &commands, &advertised, &shallow) {
                Ok(pack_lock) => lock = Some(pack_lock),
                Err(e) => {
                    tracing::warn!(repo = %self.repo.name, error = %e, "unpack failed");
                    unpack_error = Some(e);
                }
            }
        }

        if unpack_error.is_none() {
            CommandValidator::new(&self.config, &advertised, &self.repo.objects)
                .validate(&mut commands);
            BatchRefUpdate::new(self.config.ref_log_ident.clone())
                .allow_non_fast_forwards(self.config.allow_non_fast_forwards)
                .atomic(negotiated.atomic() && self.repo.supports_atomic())
                .push_options(push_options.clone())
                .push_certificate(certificate.clone())
                .execute(&self.repo.refs, &mut commands);
            fail_unprocessed(&mut commands);
        }

        let error_text = unpack_error.as_ref().map(ToString::to_string);
        let reported = StatusReport::new(&commands)
            .unpack_error(error_text.as_deref())
            .send(&mut channels, negotiated.report_status())
            .and_then(|()| channels.finish());

        if let Some(lock) = lock {
            self.repo.objects.unlock_pack(lock);
        }
        if let Some(e) = unpack_error {
            return Err(e);
        }
        reported?;

        tracing::info!(
            repo = %self.repo.name,
            commands = commands.len(),
            ok = commands.iter().filter(|c| c.result() == CommandResult::Ok).count(),
            agent = negotiated.agent().unwrap_or("unknown"),
            "push processed"
        );
        Ok(ReceiveOutcome {
            commands,
            push_options,
            certificate,
        })
    }

    fn recv_commands<R: Read, W: Write>(
        &self,
        reader: &mut PktLineReader<R>,
        channels: &mut Channels<W>,
    ) -> Result<Request> {
        let mut request = Request::default();
        let mut certificate = PushCertificateParser::new();
        let mut negotiated = false;

        while let Some(line) = reader.read_string()? {
            if let Some(hex) = line.strip_prefix("shallow ") {
                let id = ObjectId::from_hex(hex)
                    .map_err(|_| GitError::protocol(format!("malformed shallow line: {}", line)))?;
                request.shallow.insert(id);
                continue;
            }

            let mut line = line;
            if !negotiated {
                let first = FirstLine::parse(&line);
                request.negotiated = Negotiated::new(first.capabilities, &self.config);
                if let Some(frame_len) = request.negotiated.side_band() {
                    channels.enable_side_band(frame_len);
                }
                channels.set_quiet(request.negotiated.is_quiet());
                tracing::debug!(
                    side_band = ?request.negotiated.side_band(),
                    report_status = request.negotiated.report_status(),
                    atomic = request.negotiated.atomic(),
                    ofs_delta = request.negotiated.ofs_delta(),
                    "capabilities negotiated"
                );
                negotiated = true;
                line = first.line;
                if line == BEGIN_CERTIFICATE {
                    certificate.receive_header(reader)?;
                    continue;
                }
            }

            if line == BEGIN_SIGNATURE {
                certificate.receive_signature(reader)?;
                continue;
            }

            certificate.add_command(&line);
            let cmd = ReceiveCommand::parse(&line)?;
            tracing::debug!(
                ref_name = %cmd.ref_name(),
                old = %cmd.old_id(),
                new = %cmd.new_id(),
                kind = ?cmd.command_type(),
                "command received"
            );
            request.commands.push(cmd);
        }

        if request.negotiated.push_options() && !request.commands.is_empty() {
            while let Some(option) = reader.read_string()? {
                request.push_options.push(option);
            }
        }

        request.certificate = certificate.build(
            self.nonces.as_ref(),
            self.sent_nonce.as_deref(),
            &self.repo.name,
            unix_now(),
        )?;
        if let Some(cert) = &request.certificate {
            tracing::info!(
                pusher = %cert.pusher(),
                nonce_status = ?cert.nonce_status(),
                "push certificate received"
            );
        }
        Ok(request)
    }

    /// Receives the pack and checks the graph it completes. The pack lock is
    /// released again when the check fails.
    fn unpack<R: Read>(
        &self,
        reader: &mut PktLineReader<R>,
        negotiated: &Negotiated,
        commands: &[ReceiveCommand],
        advertised: &AdvertisedRefs,
        shallow: &BTreeSet<ObjectId>,
    ) -> Result<PackLock> {
        let checker = self.config.check_received_objects.then(ObjectChecker::new);
        let parser = PackParser::new(&self.repo.objects)
            .max_pack_size(self.config.max_pack_size)
            .max_object_size(self.config.max_object_size)
            .allow_ofs_delta(self.config.allow_ofs_delta && negotiated.ofs_delta())
            .checker(checker);

        let previous = match self.config.pack_timeout() {
            Some(timeout) => Some(self.swap_timeout(Some(timeout))?),
            None => None,
        };
        let parsed = parser.parse(reader.inner_mut());
        if let Some(previous) = previous {
            self.set_timeout(previous)?;
        }
        let pack = parsed?;
        tracing::debug!(
            objects = pack.objects.len(),
            bytes = pack.pack_size,
            base_objects = pack.base_objects.len(),
            "pack received"
        );

        let track = self.config.check_referenced_objects_are_reachable;
        let provided: Option<HashSet<ObjectId>> = track.then(|| pack.ids().collect());
        let base_objects = pack.base_objects.clone();
        let lock = self.repo.objects.insert_pack(pack.objects);

        if self.config.needs_connectivity_check(shallow.len()) {
            let checked = ConnectivityChecker::new(&self.repo.objects, advertised.haves())
                .shallow(shallow)
                .provided(provided.as_ref())
                .base_objects(&base_objects)
                .track_bases(track)
                .check(commands);
            if let Err(e) = checked {
                self.repo.objects.unlock_pack(lock);
                return Err(e);
            }
        }
        Ok(lock)
    }

    /// Drops request input the client has already sent, so it reads the
    /// error instead of failing on a write. A client that keeps the
    /// connection open is never waited on for longer than [`DISCARD_WAIT`]
    /// per read. Without transport control nothing is discarded.
    fn discard_pending<R: Read>(&self, input: &mut R) {
        let Some(control) = &self.timeouts else {
            return;
        };
        let previous = match control.timeout() {
            Ok(previous) => previous,
            Err(e) => {
                tracing::debug!(error = %e, "cannot read transport timeout");
                return;
            }
        };
        if let Err(e) = control.set_timeout(Some(DISCARD_WAIT)) {
            tracing::debug!(error = %e, "cannot shorten transport timeout");
            return;
        }
        discard_input(input, self.config.max_discard_bytes);
        if let Err(e) = control.set_timeout(previous) {
            tracing::debug!(error = %e, "cannot restore transport timeout");
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if let Some(control) = &self.timeouts {
            control.set_timeout(timeout)?;
        }
        Ok(())
    }

    /// Replaces the timeout and returns the one it replaced.
    fn swap_timeout(&self, timeout: Option<Duration>) -> Result<Option<Duration>> {
        match &self.timeouts {
            Some(control) => {
                let previous = control.timeout()?;
                control.set_timeout(timeout)?;
                Ok(previous)
            }
            None => Ok(None),
        }
    }
}

/// Skips at most `limit` bytes, stopping early at end of input or when a
/// read times out.
fn discard_input<R: Read>(input: &mut R, limit: u64) {
    match io::copy(&mut input.take(limit), &mut io::sink()) {
        Ok(skipped) => tracing::debug!(skipped, "discarded request input"),
        Err(e) => tracing::debug!(error = %e, "stopped discarding input"),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
