//! Structural checks on received objects.

use crate::{GitError, Result};
use weir_storage::{GitObject, ObjectType, TreeEntry};

/// Verifies that received objects are well formed before they are stored.
#[derive(Debug, Clone, Default)]
pub struct ObjectChecker {
    allow_zero_padded_modes: bool,
}

impl ObjectChecker {
    /// Creates a strict checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts tree modes written with a leading zero (`040000`), which some
    /// old tools produced.
    pub fn allow_zero_padded_modes(mut self, allow: bool) -> Self {
        self.allow_zero_padded_modes = allow;
        self
    }

    /// Checks one object.
    pub fn check(&self, object: &GitObject) -> Result<()> {
        match object.object_type {
            ObjectType::Commit => self.check_commit(object),
            ObjectType::Tree => self.check_tree(object),
            ObjectType::Tag => self.check_tag(object),
            ObjectType::Blob => Ok(()),
        }
    }

    fn check_commit(&self, object: &GitObject) -> Result<()> {
        let mut lines = header(object)?;

        let tree = lines.next().unwrap_or_default();
        let hex = tree
            .strip_prefix("tree ")
            .ok_or_else(|| invalid(object, "no tree header"))?;
        check_hex(object, hex, "invalid tree")?;

        let mut line = lines.next().unwrap_or_default();
        while let Some(hex) = line.strip_prefix("parent ") {
            check_hex(object, hex, "invalid parent")?;
            line = lines.next().unwrap_or_default();
        }

        let author = line
            .strip_prefix("author ")
            .ok_or_else(|| invalid(object, "no author"))?;
        check_ident(object, author, "invalid author")?;

        let committer = lines
            .next()
            .and_then(|l| l.strip_prefix("committer "))
            .ok_or_else(|| invalid(object, "no committer"))?;
        check_ident(object, committer, "invalid committer")
    }

    fn check_tag(&self, object: &GitObject) -> Result<()> {
        let mut lines = header(object)?;

        let hex = lines
            .next()
            .and_then(|l| l.strip_prefix("object "))
            .ok_or_else(|| invalid(object, "no object header"))?;
        check_hex(object, hex, "invalid object")?;

        let kind = lines
            .next()
            .and_then(|l| l.strip_prefix("type "))
            .ok_or_else(|| invalid(object, "no type header"))?;
        ObjectType::parse(kind).map_err(|_| invalid(object, "invalid type"))?;

        let name = lines
            .next()
            .and_then(|l| l.strip_prefix("tag "))
            .ok_or_else(|| invalid(object, "no tag header"))?;
        if name.is_empty() {
            return Err(invalid(object, "empty tag name"));
        }

        if let Some(tagger) = lines.next().and_then(|l| l.strip_prefix("tagger ")) {
            check_ident(object, tagger, "invalid tagger")?;
        }
        Ok(())
    }

    fn check_tree(&self, object: &GitObject) -> Result<()> {
        if !self.allow_zero_padded_modes && has_zero_padded_mode(&object.data) {
            return Err(invalid(object, "zero-padded file mode"));
        }
        let entries = object
            .parse_tree()
            .map_err(|e| invalid(object, &e.to_string()))?;

        let mut previous: Option<&TreeEntry> = None;
        for entry in &entries {
            check_tree_name(object, &entry.name)?;
            check_mode(object, entry.mode)?;
            if let Some(prev) = previous {
                if prev.name == entry.name {
                    return Err(invalid(object, "duplicate entry names"));
                }
            }
            previous = Some(entry);
        }
        Ok(())
    }
}

/// Header lines of a commit or tag, up to the blank line before the message.
fn header(object: &GitObject) -> Result<impl Iterator<Item = &str>> {
    let end = object
        .data
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|p| p + 1)
        .unwrap_or(object.data.len());
    let text =
        std::str::from_utf8(&object.data[..end]).map_err(|_| invalid(object, "header not UTF-8"))?;
    Ok(text.lines())
}

fn check_hex(object: &GitObject, hex: &str, what: &str) -> Result<()> {
    if hex.len() == weir_storage::HEX_LEN && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(invalid(object, what))
    }
}

/// `Name <email> <seconds> <tz>`.
fn check_ident(object: &GitObject, ident: &str, what: &str) -> Result<()> {
    let open = ident.find('<');
    let close = ident.rfind('>');
    match (open, close) {
        (Some(open), Some(close)) if open < close => {
            let when: Vec<&str> = ident[close + 1..].split_whitespace().collect();
            let valid_time = match when.as_slice() {
                [secs, tz] => {
                    secs.bytes().all(|b| b.is_ascii_digit())
                        && tz.len() == 5
                        && (tz.starts_with('+') || tz.starts_with('-'))
                        && tz[1..].bytes().all(|b| b.is_ascii_digit())
                }
                [] => true,
                _ => false,
            };
            if valid_time {
                Ok(())
            } else {
                Err(invalid(object, what))
            }
        }
        _ => Err(invalid(object, what)),
    }
}

fn check_tree_name(object: &GitObject, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(object, "empty name"));
    }
    if name == "." || name == ".." {
        return Err(invalid(object, "invalid name '.' or '..'"));
    }
    if name.contains('/') {
        return Err(invalid(object, "name contains '/'"));
    }
    if name.eq_ignore_ascii_case(".git") {
        return Err(invalid(object, "invalid name '.git'"));
    }
    Ok(())
}

fn check_mode(object: &GitObject, mode: u32) -> Result<()> {
    match mode {
        0o100644 | 0o100755 | 0o120000 | TreeEntry::MODE_TREE | TreeEntry::MODE_GITLINK => Ok(()),
        other => Err(invalid(object, &format!("invalid mode {:o}", other))),
    }
}

fn has_zero_padded_mode(data: &[u8]) -> bool {
    let mut pos = 0;
    while pos < data.len() {
        if data[pos] == b'0' {
            return true;
        }
        match data[pos..].iter().position(|&b| b == 0) {
            Some(nul) => pos += nul + 1 + 20,
            None => return false,
        }
    }
    false
}

fn invalid(object: &GitObject, reason: &str) -> GitError {
    GitError::InvalidObject {
        id: object.id,
        reason: reason.to_string(),
    }
}
