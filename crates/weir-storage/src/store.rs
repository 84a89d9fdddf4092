//! Object store and repository management.

use crate::{GitObject, ObjectId, RefStore, Reference, Result, StorageError};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Content-addressed object store.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Objects indexed by their SHA-1 hash.
    objects: RwLock<HashMap<ObjectId, GitObject>>,
    /// Names of packs received but not yet released by their session.
    locked_packs: RwLock<HashSet<String>>,
    next_pack: AtomicU64,
}

/// Handle on a received pack; keeps the pack marked in-flight until released
/// with [`ObjectStore::unlock_pack`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pack lock must be released with ObjectStore::unlock_pack"]
pub struct PackLock {
    name: String,
}

impl PackLock {
    /// Name of the locked pack.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ObjectStore {
    /// Creates a new empty object store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object and returns its ID.
    pub fn put(&self, object: GitObject) -> ObjectId {
        let id = object.id;
        self.objects.write().insert(id, object);
        id
    }

    /// Retrieves an object by ID.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Checks if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Lists all object IDs.
    pub fn list_objects(&self) -> Vec<ObjectId> {
        self.objects.read().keys().copied().collect()
    }

    /// Stores a blob and returns its ID.
    pub fn put_blob(&self, content: impl Into<Bytes>) -> ObjectId {
        self.put(GitObject::blob(content))
    }

    /// Stores the objects of a received pack and locks the pack.
    pub fn insert_pack(&self, objects: Vec<GitObject>) -> PackLock {
        let name = format!(
            "pack-{:08}",
            self.next_pack.fetch_add(1, Ordering::Relaxed)
        );
        {
            let mut store = self.objects.write();
            for object in objects {
                store.insert(object.id, object);
            }
        }
        self.locked_packs.write().insert(name.clone());
        tracing::debug!(pack = %name, "pack locked");
        PackLock { name }
    }

    /// Releases a pack lock.
    pub fn unlock_pack(&self, lock: PackLock) {
        self.locked_packs.write().remove(&lock.name);
        tracing::debug!(pack = %lock.name, "pack unlocked");
    }

    /// Returns true while a pack is held by a session.
    pub fn is_pack_locked(&self, name: &str) -> bool {
        self.locked_packs.read().contains(name)
    }
}

/// A git repository with objects and references.
#[derive(Debug)]
pub struct Repository {
    /// Repository name (its path under the daemon root).
    pub name: String,
    /// Object store.
    pub objects: Arc<ObjectStore>,
    /// Reference store.
    pub refs: Arc<RefStore>,
    /// Extra tips the server already has but does not advertise as refs
    /// (for example objects borrowed from an alternate repository).
    additional_haves: RwLock<Vec<ObjectId>>,
    /// Whether the ref store honours all-or-nothing batches.
    atomic_refs: bool,
}

impl Repository {
    /// Creates a new empty repository with `HEAD` pointing at `refs/heads/main`.
    pub fn new(name: impl Into<String>) -> Self {
        let refs = Arc::new(RefStore::new());
        refs.set_symbolic("HEAD", "refs/heads/main");

        Self {
            name: name.into(),
            objects: Arc::new(ObjectStore::new()),
            refs,
            additional_haves: RwLock::new(Vec::new()),
            atomic_refs: true,
        }
    }

    /// Disables atomic ref transactions for this repository.
    pub fn without_atomic_refs(mut self) -> Self {
        self.atomic_refs = false;
        self
    }

    /// Returns true if the ref store supports atomic batches.
    pub fn supports_atomic(&self) -> bool {
        self.atomic_refs
    }

    /// Gets the current HEAD commit.
    pub fn head(&self) -> Result<ObjectId> {
        self.refs.resolve_head()
    }

    /// Gets the current branch name.
    pub fn current_branch(&self) -> Option<String> {
        self.refs.current_branch()
    }

    /// Adds a tip the server treats as already known.
    pub fn add_additional_have(&self, id: ObjectId) {
        self.additional_haves.write().push(id);
    }

    /// Returns the extra tips the server treats as already known.
    pub fn additional_haves(&self) -> Vec<ObjectId> {
        self.additional_haves.read().clone()
    }

    /// Lists all references.
    pub fn list_refs(&self) -> Vec<(String, Reference)> {
        self.refs.list_all()
    }
}

/// Registry of repositories served by one node, keyed by path.
#[derive(Debug, Default)]
pub struct RepoStore {
    repos: RwLock<HashMap<String, Arc<Repository>>>,
}

impl RepoStore {
    /// Creates a new empty repository store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new repository.
    pub fn create(&self, name: &str) -> Result<Arc<Repository>> {
        let mut repos = self.repos.write();
        if repos.contains_key(name) {
            return Err(StorageError::RepoExists(name.to_string()));
        }
        let repo = Arc::new(Repository::new(name));
        repos.insert(name.to_string(), repo.clone());
        Ok(repo)
    }

    /// Gets a repository by name.
    pub fn get(&self, name: &str) -> Result<Arc<Repository>> {
        self.repos
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::RepoNotFound(name.to_string()))
    }

    /// Gets a repository, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<Repository> {
        if let Some(repo) = self.repos.read().get(name) {
            return repo.clone();
        }
        self.repos
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(repo = %name, "creating repository");
                Arc::new(Repository::new(name))
            })
            .clone()
    }

    /// Lists all repository names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.repos.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_store_roundtrip() {
        let store = ObjectStore::new();
        let blob = GitObject::blob(b"Hello, World!".to_vec());
        let id = blob.id;

        store.put(blob);

        let retrieved = store.get(&id).unwrap();
        assert_eq!(retrieved.data.as_ref(), b"Hello, World!");
        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_object_store_missing() {
        let store = ObjectStore::new();
        let id = ObjectId::from_bytes([1u8; 20]);
        assert!(matches!(store.get(&id), Err(StorageError::ObjectNotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_insert_pack_and_unlock() {
        let store = ObjectStore::new();
        let a = GitObject::blob(b"a".to_vec());
        let b = GitObject::blob(b"b".to_vec());
        let (id_a, id_b) = (a.id, b.id);

        let lock = store.insert_pack(vec![a, b]);
        let name = lock.name().to_string();

        assert!(store.contains(&id_a));
        assert!(store.contains(&id_b));
        assert!(store.is_pack_locked(&name));

        store.unlock_pack(lock);
        assert!(!store.is_pack_locked(&name));
        assert!(store.contains(&id_a));
    }

    #[test]
    fn test_pack_names_unique() {
        let store = ObjectStore::new();
        let first = store.insert_pack(Vec::new());
        let second = store.insert_pack(Vec::new());
        assert_ne!(first.name(), second.name());
        store.unlock_pack(first);
        store.unlock_pack(second);
    }

    #[test]
    fn test_repository_creation() {
        let repos = RepoStore::new();
        let repo = repos.create("team/project.git").unwrap();

        assert_eq!(repo.name, "team/project.git");
        assert_eq!(repo.current_branch(), Some("main".to_string()));
        assert!(repo.head().is_err());
        assert!(repo.supports_atomic());
        assert!(repos.create("team/project.git").is_err());
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let repos = RepoStore::new();
        let first = repos.get_or_create("a.git");
        let second = repos.get_or_create("a.git");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(repos.names(), vec!["a.git".to_string()]);
        assert!(repos.get("b.git").is_err());
    }

    #[test]
    fn test_additional_haves() {
        let repo = Repository::new("r");
        let id = ObjectId::from_bytes([5u8; 20]);
        repo.add_additional_have(id);
        assert_eq!(repo.additional_haves(), vec![id]);
    }

    #[test]
    fn test_without_atomic_refs() {
        let repo = Repository::new("r").without_atomic_refs();
        assert!(!repo.supports_atomic());
    }
}
