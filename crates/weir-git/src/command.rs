//! Ref update commands sent by the client.

use crate::{GitError, Result};
use std::fmt;
use weir_storage::{ObjectId, RefEdit, HEX_LEN};

/// Shortest well-formed command line: two ids, two spaces, one name byte.
const MIN_COMMAND_LEN: usize = 2 * HEX_LEN + 3;

/// What a command does to its ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Creates a ref that should not exist yet.
    Create,
    /// Moves an existing ref forward.
    Update,
    /// Moves an existing ref to a commit that does not descend from it.
    UpdateNonFastForward,
    /// Removes a ref.
    Delete,
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandResult {
    /// Not decided yet.
    NotAttempted,
    /// Applied.
    Ok,
    /// Ref creation is disabled.
    RejectedNoCreate,
    /// Ref deletion is disabled.
    RejectedNoDelete,
    /// Non-fast-forward update refused.
    RejectedNonFastForward,
    /// Update of the checked-out branch refused.
    RejectedCurrentBranch,
    /// An object the command needs is not in the repository.
    RejectedMissingObject,
    /// Rejected for the reason in the command message.
    RejectedOtherReason,
    /// The ref changed underneath the update.
    LockFailure,
}

impl CommandResult {
    /// Returns true once a verdict has been reached.
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::NotAttempted)
    }
}

/// One requested ref change and its eventual outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveCommand {
    old_id: ObjectId,
    new_id: ObjectId,
    ref_name: String,
    command_type: CommandType,
    result: CommandResult,
    message: Option<String>,
}

impl ReceiveCommand {
    /// Creates a command, classifying it from its ids.
    pub fn new(old_id: ObjectId, new_id: ObjectId, ref_name: impl Into<String>) -> Self {
        let command_type = if new_id.is_zero() {
            CommandType::Delete
        } else if old_id.is_zero() {
            CommandType::Create
        } else {
            CommandType::Update
        };
        Self {
            old_id,
            new_id,
            ref_name: ref_name.into(),
            command_type,
            result: CommandResult::NotAttempted,
            message: None,
        }
    }

    /// Parses a `<old> <new> <name>` line.
    ///
    /// The ids sit at fixed offsets; anything shorter than the minimum line,
    /// with malformed ids, or with control characters in the name is a
    /// protocol error. A command for `HEAD` is rejected on the spot.
    pub fn parse(line: &str) -> Result<Self> {
        let bytes = line.as_bytes();
        if bytes.len() < MIN_COMMAND_LEN {
            return Err(GitError::protocol(format!("malformed command: {}", line)));
        }
        if bytes[HEX_LEN] != b' ' || bytes[2 * HEX_LEN + 1] != b' ' {
            return Err(GitError::protocol(format!("malformed command: {}", line)));
        }
        let old_id = parse_id(&bytes[..HEX_LEN], line)?;
        let new_id = parse_id(&bytes[HEX_LEN + 1..2 * HEX_LEN + 1], line)?;
        let name = &line[2 * HEX_LEN + 2..];
        if name.chars().any(|c| c.is_control()) {
            return Err(GitError::protocol(format!("malformed ref name: {:?}", name)));
        }

        let mut cmd = Self::new(old_id, new_id, name);
        if name == "HEAD" {
            cmd.set_result(CommandResult::RejectedCurrentBranch, None);
        }
        Ok(cmd)
    }

    /// Expected current value of the ref.
    pub fn old_id(&self) -> ObjectId {
        self.old_id
    }

    /// Requested new value of the ref.
    pub fn new_id(&self) -> ObjectId {
        self.new_id
    }

    /// Ref name.
    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    /// Current classification.
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Current result.
    pub fn result(&self) -> CommandResult {
        self.result
    }

    /// Optional detail attached to the result.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true for deletions.
    pub fn is_delete(&self) -> bool {
        self.command_type == CommandType::Delete
    }

    /// Reclassifies an update as non-fast-forward. Other types are left alone.
    pub fn mark_non_fast_forward(&mut self) {
        if self.command_type == CommandType::Update {
            self.command_type = CommandType::UpdateNonFastForward;
        }
    }

    /// Records the outcome.
    ///
    /// A decided command keeps its first verdict: later calls are refused
    /// and return false.
    pub fn set_result(&mut self, result: CommandResult, message: Option<String>) -> bool {
        if self.result.is_decided() {
            tracing::warn!(
                ref_name = %self.ref_name,
                current = ?self.result,
                refused = ?result,
                "command already decided"
            );
            return false;
        }
        self.result = result;
        self.message = message;
        true
    }

    /// Shorthand for rejecting with a free-form reason.
    pub fn reject(&mut self, reason: impl Into<String>) -> bool {
        self.set_result(CommandResult::RejectedOtherReason, Some(reason.into()))
    }

    /// Human-readable reason for a failed command.
    pub fn reason(&self) -> String {
        match self.result {
            CommandResult::NotAttempted => "server bug; ref not processed".to_string(),
            CommandResult::Ok => "ok".to_string(),
            CommandResult::RejectedNoCreate => "creation prohibited".to_string(),
            CommandResult::RejectedNoDelete => "deletion prohibited".to_string(),
            CommandResult::RejectedNonFastForward => "non-fast forward".to_string(),
            CommandResult::RejectedCurrentBranch => "branch is currently checked out".to_string(),
            CommandResult::RejectedMissingObject => match self.message.as_deref() {
                None => "missing object(s)".to_string(),
                Some(msg) if ObjectId::from_hex(msg).is_ok() => format!("object {} missing", msg),
                Some(msg) => msg.to_string(),
            },
            CommandResult::RejectedOtherReason => self
                .message
                .clone()
                .unwrap_or_else(|| "unspecified reason".to_string()),
            CommandResult::LockFailure => "failed to lock".to_string(),
        }
    }

    /// The edit handed to the ref store.
    pub fn to_ref_edit(&self) -> RefEdit {
        RefEdit::new(self.ref_name.clone(), self.old_id, self.new_id)
    }
}

impl fmt::Display for ReceiveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old_id, self.new_id, self.ref_name)
    }
}

fn parse_id(hex: &[u8], line: &str) -> Result<ObjectId> {
    std::str::from_utf8(hex)
        .ok()
        .and_then(|s| ObjectId::from_hex(s).ok())
        .ok_or_else(|| GitError::protocol(format!("malformed command: {}", line)))
}

/// Checks a ref name against git's ref format rules.
///
/// Rejects empty components, components starting with `.` or ending with
/// `.lock`, `..`, `@{`, a lone `@`, a trailing `.` or `/`, and the
/// characters git forbids (control characters, space, `~^:?*[\`).
pub fn is_valid_ref_name(name: &str) -> bool {
    if name.is_empty() || name == "@" || name.ends_with('/') || name.ends_with('.') {
        return false;
    }
    if name.contains("..") || name.contains("@{") {
        return false;
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return false;
    }
    name.split('/')
        .all(|part| !part.is_empty() && !part.starts_with('.') && !part.ends_with(".lock"))
}
