//! Reachability check of the object graph after a pack is received.
//!
//! Everything reachable from the new tips must be either already known to
//! the server (reachable from what it advertised) or present in the
//! repository. The known part is computed first as the *uninteresting* set;
//! the walk then covers only what the push introduced.

use crate::command::ReceiveCommand;
use crate::{GitError, Result};
use std::collections::{BTreeSet, HashSet};
use weir_storage::{GitObject, ObjectId, ObjectStore, ObjectType, TreeEntry};

/// Walks the pushed graph and fails on the first missing object.
pub struct ConnectivityChecker<'a> {
    store: &'a ObjectStore,
    haves: Vec<ObjectId>,
    shallow: BTreeSet<ObjectId>,
    provided: Option<&'a HashSet<ObjectId>>,
    base_objects: &'a [ObjectId],
    track_bases: bool,
}

impl std::fmt::Debug for ConnectivityChecker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityChecker")
            .field("haves", &self.haves.len())
            .field("shallow", &self.shallow.len())
            .field("provided", &self.provided.map(HashSet::len))
            .field("base_objects", &self.base_objects.len())
            .field("track_bases", &self.track_bases)
            .finish()
    }
}

impl<'a> ConnectivityChecker<'a> {
    /// Creates a checker over `store`, seeded with the server's haves.
    pub fn new(store: &'a ObjectStore, haves: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            store,
            haves: haves.into_iter().collect(),
            shallow: BTreeSet::new(),
            provided: None,
            base_objects: &[],
            track_bases: false,
        }
    }

    /// Commits the client declared shallow; their parents are not walked.
    pub fn shallow(mut self, shallow: &BTreeSet<ObjectId>) -> Self {
        self.shallow = shallow.clone();
        self
    }

    /// Requires every interesting object to come from this set (the objects
    /// of the received pack).
    pub fn provided(mut self, provided: Option<&'a HashSet<ObjectId>>) -> Self {
        self.provided = provided;
        self
    }

    /// Delta bases the pack borrowed from the repository.
    pub fn base_objects(mut self, base_objects: &'a [ObjectId]) -> Self {
        self.base_objects = base_objects;
        self
    }

    /// Marks trees of known commits as known too, and requires borrowed
    /// delta bases to be known.
    pub fn track_bases(mut self, track: bool) -> Self {
        self.track_bases = track;
        self
    }

    /// Runs the check for every undecided, non-delete command.
    pub fn check(&self, commands: &[ReceiveCommand]) -> Result<()> {
        let uninteresting = self.uninteresting();

        let mut queue: Vec<(ObjectId, ObjectType)> = Vec::new();
        for cmd in commands {
            if cmd.result().is_decided() || cmd.is_delete() || cmd.new_id().is_zero() {
                continue;
            }
            let id = cmd.new_id();
            let object = self.store.get(&id).map_err(|_| missing(id, "object"))?;
            queue.push((id, object.object_type));
        }

        let mut seen: HashSet<ObjectId> = HashSet::new();
        while let Some((id, kind)) = queue.pop() {
            if uninteresting.contains(&id) || !seen.insert(id) {
                continue;
            }
            if let Some(provided) = self.provided {
                if !provided.contains(&id) {
                    return Err(missing(id, kind.as_str()));
                }
            }
            match kind {
                ObjectType::Commit => {
                    let info = self
                        .load(id, kind)?
                        .parse_commit()
                        .map_err(|_| missing(id, "commit"))?;
                    queue.push((info.tree, ObjectType::Tree));
                    if !self.shallow.contains(&id) {
                        queue.extend(info.parents.into_iter().map(|p| (p, ObjectType::Commit)));
                    }
                }
                ObjectType::Tree => {
                    let entries = self
                        .load(id, kind)?
                        .parse_tree()
                        .map_err(|_| missing(id, "tree"))?;
                    queue.extend(entries.iter().filter_map(entry_kind));
                }
                ObjectType::Tag => {
                    let info = self
                        .load(id, kind)?
                        .parse_tag()
                        .map_err(|_| missing(id, "tag"))?;
                    queue.push((info.object, info.object_type));
                }
                ObjectType::Blob => {
                    if !self.store.contains(&id) {
                        return Err(missing(id, "blob"));
                    }
                }
            }
        }

        if self.track_bases {
            for base in self.base_objects {
                if !uninteresting.contains(base) {
                    return Err(missing(*base, "base object"));
                }
            }
        }

        for id in &self.shallow {
            if !uninteresting.contains(id) {
                return Err(missing(*id, "shallow commit"));
            }
        }

        tracing::debug!(walked = seen.len(), known = uninteresting.len(), "connectivity ok");
        Ok(())
    }

    /// The closure of the haves over commit parents, plus (with base
    /// tracking) the trees and blobs of those commits. Ids missing from the
    /// store are marked but not expanded.
    fn uninteresting(&self) -> HashSet<ObjectId> {
        let mut marked = HashSet::new();
        let mut queue: Vec<ObjectId> = self.haves.clone();
        let mut trees: Vec<ObjectId> = Vec::new();

        while let Some(id) = queue.pop() {
            if marked.contains(&id) {
                continue;
            }
            let Ok(object) = self.store.get(&id) else {
                marked.insert(id);
                continue;
            };
            match object.object_type {
                ObjectType::Commit => {
                    marked.insert(id);
                    if let Ok(info) = object.parse_commit() {
                        if self.track_bases {
                            trees.push(info.tree);
                        }
                        queue.extend(info.parents);
                    }
                }
                ObjectType::Tag => {
                    marked.insert(id);
                    if let Ok(info) = object.parse_tag() {
                        queue.push(info.object);
                    }
                }
                ObjectType::Tree if self.track_bases => trees.push(id),
                ObjectType::Tree | ObjectType::Blob => {
                    marked.insert(id);
                }
            }
        }

        while let Some(id) = trees.pop() {
            if !marked.insert(id) {
                continue;
            }
            let Ok(tree) = self.store.get(&id) else {
                continue;
            };
            if let Ok(entries) = tree.parse_tree() {
                for entry in &entries {
                    if entry.is_tree() {
                        trees.push(entry.id);
                    } else if !entry.is_gitlink() {
                        marked.insert(entry.id);
                    }
                }
            }
        }
        marked
    }

    fn load(&self, id: ObjectId, kind: ObjectType) -> Result<GitObject> {
        match self.store.get(&id) {
            Ok(object) if object.object_type == kind => Ok(object),
            _ => Err(missing(id, kind.as_str())),
        }
    }
}

fn entry_kind(entry: &TreeEntry) -> Option<(ObjectId, ObjectType)> {
    if entry.is_gitlink() {
        None
    } else if entry.is_tree() {
        Some((entry.id, ObjectType::Tree))
    } else {
        Some((entry.id, ObjectType::Blob))
    }
}

fn missing(id: ObjectId, kind: &'static str) -> GitError {
    GitError::MissingObject { id, kind }
}
