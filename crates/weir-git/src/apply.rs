//! Applies the surviving commands to the ref store as one batch.

use crate::certificate::PushCertificate;
use crate::command::{CommandResult, CommandType, ReceiveCommand};
use weir_storage::{RefEditStatus, RefStore};

/// Reflog message recorded for every pushed update.
pub const REFLOG_MESSAGE: &str = "push";

/// Reason given to commands dropped from a failed atomic batch.
pub const TRANSACTION_ABORTED: &str = "transaction aborted";

/// A batch of ref updates built from the pending commands of a session.
#[derive(Debug, Clone)]
pub struct BatchRefUpdate {
    ident: String,
    allow_non_fast_forwards: bool,
    atomic: bool,
    push_options: Vec<String>,
    push_certificate: Option<PushCertificate>,
}

impl BatchRefUpdate {
    /// Creates a non-atomic batch that writes `ident` to the reflog.
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            allow_non_fast_forwards: true,
            atomic: false,
            push_options: Vec::new(),
            push_certificate: None,
        }
    }

    /// Whether non-fast-forward updates may be applied.
    pub fn allow_non_fast_forwards(mut self, allow: bool) -> Self {
        self.allow_non_fast_forwards = allow;
        self
    }

    /// Applies all commands or none.
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Push options sent by the client.
    pub fn push_options(mut self, options: Vec<String>) -> Self {
        self.push_options = options;
        self
    }

    /// Certificate signed over the command list.
    pub fn push_certificate(mut self, certificate: Option<PushCertificate>) -> Self {
        self.push_certificate = certificate;
        self
    }

    /// Push options attached to the batch.
    pub fn options(&self) -> &[String] {
        &self.push_options
    }

    /// Certificate attached to the batch.
    pub fn certificate(&self) -> Option<&PushCertificate> {
        self.push_certificate.as_ref()
    }

    /// Returns true for an all-or-nothing batch.
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Executes the batch against `refs`, recording a verdict on every
    /// command that was still pending. Decided commands are left untouched.
    pub fn execute(&self, refs: &RefStore, commands: &mut [ReceiveCommand]) {
        if !self.allow_non_fast_forwards {
            for cmd in commands.iter_mut() {
                if cmd.command_type() == CommandType::UpdateNonFastForward
                    && !cmd.result().is_decided()
                {
                    cmd.set_result(CommandResult::RejectedNonFastForward, None);
                }
            }
        }

        if self.atomic && commands.iter().any(|c| c.result().is_decided()) {
            for cmd in commands.iter_mut().filter(|c| !c.result().is_decided()) {
                cmd.reject(TRANSACTION_ABORTED);
            }
            tracing::debug!("atomic push aborted before ref update");
            return;
        }

        let pending: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| c.result() == CommandResult::NotAttempted)
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return;
        }

        let edits: Vec<_> = pending.iter().map(|&i| commands[i].to_ref_edit()).collect();
        let statuses = match refs.commit_edits(&edits, self.atomic, &self.ident, REFLOG_MESSAGE) {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!(error = %e, "ref update failed");
                let reason = e.to_string();
                for &i in &pending {
                    commands[i].reject(reason.clone());
                }
                return;
            }
        };

        for (&i, status) in pending.iter().zip(statuses) {
            let cmd = &mut commands[i];
            match status {
                RefEditStatus::Ok => cmd.set_result(CommandResult::Ok, None),
                RefEditStatus::LockFailure => cmd.set_result(CommandResult::LockFailure, None),
                RefEditStatus::Aborted => cmd.reject(TRANSACTION_ABORTED),
            };
            tracing::debug!(ref_name = %cmd.ref_name(), result = ?cmd.result(), "ref update");
        }
    }
}
