//! Git reference management.

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Maximum depth followed when resolving symbolic references.
const MAX_SYMREF_DEPTH: usize = 5;

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }

    /// Returns true for symbolic references.
    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(_))
    }
}

/// One requested change in a batch of reference edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEdit {
    /// Reference name.
    pub name: String,
    /// Expected current value; zero means the ref must not exist.
    pub old_id: ObjectId,
    /// New value; zero deletes the ref.
    pub new_id: ObjectId,
}

impl RefEdit {
    /// Creates a new edit.
    pub fn new(name: impl Into<String>, old_id: ObjectId, new_id: ObjectId) -> Self {
        Self {
            name: name.into(),
            old_id,
            new_id,
        }
    }
}

/// Outcome of a single edit within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefEditStatus {
    /// The edit was applied.
    Ok,
    /// The ref no longer has the expected old value.
    LockFailure,
    /// Another edit in the same atomic batch failed, so this one was not applied.
    Aborted,
}

/// A single reflog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    /// Value before the change (zero for creation).
    pub old_id: ObjectId,
    /// Value after the change (zero for deletion).
    pub new_id: ObjectId,
    /// Identity that performed the change.
    pub identity: String,
    /// Free-form message.
    pub message: String,
}

#[derive(Debug, Default)]
struct RefTable {
    refs: HashMap<String, Reference>,
    reflog: HashMap<String, Vec<ReflogEntry>>,
}

impl RefTable {
    fn resolve(&self, name: &str) -> Option<ObjectId> {
        let mut current = name;
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.refs.get(current)? {
                Reference::Direct(id) => return Some(*id),
                Reference::Symbolic(target) => current = target.as_str(),
            }
        }
        None
    }

    /// Follows symbolic refs to the name that actually holds a value.
    fn leaf_name<'a>(&'a self, name: &'a str) -> &'a str {
        let mut current = name;
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.refs.get(current) {
                Some(Reference::Symbolic(target)) => current = target.as_str(),
                _ => break,
            }
        }
        current
    }

    fn check(&self, edit: &RefEdit) -> bool {
        let current = self.resolve(&edit.name);
        match current {
            None => edit.old_id.is_zero(),
            Some(id) => (edit.old_id.is_zero() && edit.new_id.is_zero()) || id == edit.old_id,
        }
    }

    fn apply(&mut self, edit: &RefEdit, identity: &str, message: &str) {
        let leaf = self.leaf_name(&edit.name).to_string();
        let old_id = self.resolve(&leaf).unwrap_or(ObjectId::ZERO);
        if old_id.is_zero() && edit.new_id.is_zero() {
            return;
        }
        if edit.new_id.is_zero() {
            self.refs.remove(&leaf);
        } else {
            self.refs.insert(leaf.clone(), Reference::Direct(edit.new_id));
        }
        self.reflog.entry(leaf).or_default().push(ReflogEntry {
            old_id,
            new_id: edit.new_id,
            identity: identity.to_string(),
            message: message.to_string(),
        });
    }
}

/// Thread-safe reference store.
#[derive(Debug, Default)]
pub struct RefStore {
    table: RwLock<RefTable>,
}

impl RefStore {
    /// Creates a new empty reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a reference by name.
    pub fn get(&self, name: &str) -> Result<Reference> {
        self.table
            .read()
            .refs
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Sets a reference to point to an object.
    pub fn set(&self, name: &str, target: ObjectId) {
        self.table
            .write()
            .refs
            .insert(name.to_string(), Reference::Direct(target));
    }

    /// Sets a symbolic reference.
    pub fn set_symbolic(&self, name: &str, target: &str) {
        self.table
            .write()
            .refs
            .insert(name.to_string(), Reference::Symbolic(target.to_string()));
    }

    /// Deletes a reference.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.table
            .write()
            .refs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Resolves a reference, following symbolic refs.
    ///
    /// Returns `None` for absent refs and for symbolic refs whose target is
    /// unborn.
    pub fn resolve(&self, name: &str) -> Option<ObjectId> {
        self.table.read().resolve(name)
    }

    /// Lists all references, sorted by name.
    pub fn list_all(&self) -> Vec<(String, Reference)> {
        let table = self.table.read();
        let sorted: BTreeMap<_, _> = table.refs.iter().collect();
        sorted
            .into_iter()
            .map(|(name, refr)| (name.clone(), refr.clone()))
            .collect()
    }

    /// Takes a consistent snapshot of every ref and its resolved value.
    pub fn snapshot(&self) -> BTreeMap<String, (Reference, Option<ObjectId>)> {
        let table = self.table.read();
        table
            .refs
            .iter()
            .map(|(name, refr)| (name.clone(), (refr.clone(), table.resolve(name))))
            .collect()
    }

    /// Resolves HEAD to find the current commit.
    pub fn resolve_head(&self) -> Result<ObjectId> {
        self.resolve("HEAD")
            .ok_or_else(|| StorageError::InvalidRef("HEAD does not resolve".to_string()))
    }

    /// Gets the current branch name (if HEAD is symbolic).
    pub fn current_branch(&self) -> Option<String> {
        match self.get("HEAD").ok()? {
            Reference::Symbolic(target) => {
                target.strip_prefix("refs/heads/").map(|s| s.to_string())
            }
            Reference::Direct(_) => None,
        }
    }

    /// Applies a batch of edits under a single lock.
    ///
    /// Each edit is checked against the current value of its ref. When
    /// `atomic` is set and any edit fails its check, nothing is applied: the
    /// failing edits report [`RefEditStatus::LockFailure`] and the others
    /// [`RefEditStatus::Aborted`]. Without `atomic`, passing edits are applied
    /// independently. Every applied edit is recorded in the reflog.
    ///
    /// A batch naming the same ref twice, or containing a name the store
    /// cannot hold, is refused as a whole.
    pub fn commit_edits(
        &self,
        edits: &[RefEdit],
        atomic: bool,
        identity: &str,
        message: &str,
    ) -> Result<Vec<RefEditStatus>> {
        let mut names = HashSet::new();
        for edit in edits {
            if edit.name.is_empty() || edit.name.contains('\0') {
                return Err(StorageError::InvalidRef(format!("{:?}", edit.name)));
            }
            if !names.insert(edit.name.as_str()) {
                return Err(StorageError::InvalidRef(format!(
                    "multiple updates for ref {}",
                    edit.name
                )));
            }
        }

        let mut table = self.table.write();
        let checks: Vec<bool> = edits.iter().map(|edit| table.check(edit)).collect();

        if atomic && checks.iter().any(|ok| !ok) {
            tracing::debug!(edits = edits.len(), "atomic ref transaction aborted");
            return Ok(checks
                .into_iter()
                .map(|ok| {
                    if ok {
                        RefEditStatus::Aborted
                    } else {
                        RefEditStatus::LockFailure
                    }
                })
                .collect());
        }

        Ok(edits
            .iter()
            .zip(checks)
            .map(|(edit, ok)| {
                if ok {
                    table.apply(edit, identity, message);
                    RefEditStatus::Ok
                } else {
                    RefEditStatus::LockFailure
                }
            })
            .collect())
    }

    /// Returns the reflog of a ref, oldest entry first.
    pub fn reflog(&self, name: &str) -> Vec<ReflogEntry> {
        self.table
            .read()
            .reflog
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}
