//! Git object types and utilities.

use crate::{Result, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a hex-encoded object id.
pub const HEX_LEN: usize = 40;

/// A 20-byte SHA-1 object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// The all-zero id, used on the wire for "no object".
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a 20-byte slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = slice.try_into().map_err(|_| {
            StorageError::InvalidObject(format!("invalid raw object id length: {}", slice.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Creates an ObjectId from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != HEX_LEN {
            return Err(StorageError::InvalidObject(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns true for the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Computes the SHA-1 hash of data with a git object header.
    pub fn hash_object(object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used in git.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The graph-relevant headers of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Root tree of the commit.
    pub tree: ObjectId,
    /// Parent commits, in header order.
    pub parents: Vec<ObjectId>,
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Octal file mode (e.g. `0o100644`, `0o40000`).
    pub mode: u32,
    /// Entry name (a single path component).
    pub name: String,
    /// Object the entry points to.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Mode of a subtree entry.
    pub const MODE_TREE: u32 = 0o40000;
    /// Mode of a submodule (gitlink) entry.
    pub const MODE_GITLINK: u32 = 0o160000;

    /// Returns true if the entry is a subtree.
    pub fn is_tree(&self) -> bool {
        self.mode == Self::MODE_TREE
    }

    /// Returns true if the entry points to a commit in another repository.
    pub fn is_gitlink(&self) -> bool {
        self.mode == Self::MODE_GITLINK
    }
}

/// The headers of an annotated tag that name its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    /// Tagged object.
    pub object: ObjectId,
    /// Declared type of the tagged object.
    pub object_type: ObjectType,
    /// Tag name.
    pub name: String,
}

/// A git object (blob, tree, commit, or tag).
#[derive(Debug, Clone)]
pub struct GitObject {
    /// The object's unique identifier (SHA-1 hash).
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed).
    pub data: Bytes,
}

impl GitObject {
    /// Creates a new git object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Creates a blob object from file content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a tree object from `(mode, name, id)` entries.
    ///
    /// Entries are written in the order given; callers that need git's
    /// canonical ordering must sort them first.
    pub fn tree(entries: &[(u32, &str, ObjectId)]) -> Self {
        let mut data = Vec::new();
        for (mode, name, id) in entries {
            data.extend_from_slice(format!("{:o} {}", mode, name).as_bytes());
            data.push(0);
            data.extend_from_slice(id.as_bytes());
        }
        Self::new(ObjectType::Tree, data)
    }

    /// Creates a commit object.
    pub fn commit(
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::new(ObjectType::Commit, content.into_bytes())
    }

    /// Creates an annotated tag object.
    pub fn tag(
        target: &ObjectId,
        target_type: ObjectType,
        name: &str,
        tagger: &str,
        message: &str,
    ) -> Self {
        let content = format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
            target, target_type, name, tagger, message
        );
        Self::new(ObjectType::Tag, content.into_bytes())
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Parses the tree and parent headers of a commit.
    pub fn parse_commit(&self) -> Result<CommitInfo> {
        self.expect_type(ObjectType::Commit)?;
        let mut tree = None;
        let mut parents = Vec::new();
        for line in header_lines(&self.data) {
            if let Some(hex) = line.strip_prefix(b"tree ") {
                tree = Some(parse_hex_id(hex)?);
            } else if let Some(hex) = line.strip_prefix(b"parent ") {
                parents.push(parse_hex_id(hex)?);
            }
        }
        let tree = tree.ok_or_else(|| {
            StorageError::InvalidObject(format!("commit {} has no tree", self.id))
        })?;
        Ok(CommitInfo { tree, parents })
    }

    /// Parses the entries of a tree.
    pub fn parse_tree(&self) -> Result<Vec<TreeEntry>> {
        self.expect_type(ObjectType::Tree)?;
        let data = &self.data[..];
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let space = data[pos..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| self.corrupt("tree entry without mode"))?;
            let mode_str = std::str::from_utf8(&data[pos..pos + space])
                .map_err(|_| self.corrupt("tree entry mode is not ascii"))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| self.corrupt("tree entry mode is not octal"))?;
            pos += space + 1;

            let nul = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| self.corrupt("tree entry without name terminator"))?;
            let name = String::from_utf8_lossy(&data[pos..pos + nul]).into_owned();
            pos += nul + 1;

            if pos + 20 > data.len() {
                return Err(self.corrupt("truncated tree entry id"));
            }
            let id = ObjectId::from_slice(&data[pos..pos + 20])?;
            pos += 20;

            entries.push(TreeEntry { mode, name, id });
        }
        Ok(entries)
    }

    /// Parses the target headers of an annotated tag.
    pub fn parse_tag(&self) -> Result<TagInfo> {
        self.expect_type(ObjectType::Tag)?;
        let mut object = None;
        let mut object_type = None;
        let mut name = None;
        for line in header_lines(&self.data) {
            if let Some(hex) = line.strip_prefix(b"object ") {
                object = Some(parse_hex_id(hex)?);
            } else if let Some(t) = line.strip_prefix(b"type ") {
                object_type = Some(ObjectType::parse(&String::from_utf8_lossy(t))?);
            } else if let Some(n) = line.strip_prefix(b"tag ") {
                name = Some(String::from_utf8_lossy(n).into_owned());
            }
        }
        match (object, object_type, name) {
            (Some(object), Some(object_type), Some(name)) => Ok(TagInfo {
                object,
                object_type,
                name,
            }),
            _ => Err(self.corrupt("tag is missing object, type or tag header")),
        }
    }

    fn expect_type(&self, expected: ObjectType) -> Result<()> {
        if self.object_type == expected {
            Ok(())
        } else {
            Err(StorageError::InvalidObject(format!(
                "{} is a {}, not a {}",
                self.id, self.object_type, expected
            )))
        }
    }

    fn corrupt(&self, what: &str) -> StorageError {
        StorageError::InvalidObject(format!("{}: {}", self.id, what))
    }
}

/// Iterates the header lines of a commit or tag, stopping at the blank line.
fn header_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n').take_while(|line| !line.is_empty())
}

fn parse_hex_id(hex: &[u8]) -> Result<ObjectId> {
    let s = std::str::from_utf8(hex)
        .map_err(|_| StorageError::InvalidObject("object id is not ascii".to_string()))?;
    ObjectId::from_hex(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_roundtrip() {
        let hex = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";
        let id = ObjectId::from_hex(hex).unwrap();
        assert_eq!(id.to_hex(), hex);
    }

    #[test]
    fn test_blob_hash() {
        // "hello\n" should hash to a well-known value
        let obj = GitObject::blob(b"hello\n".to_vec());
        assert_eq!(obj.id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_object_id_zero() {
        assert!(ObjectId::ZERO.is_zero());
        assert_eq!(ObjectId::ZERO.to_hex(), "0".repeat(40));
        assert!(!ObjectId::from_bytes([1u8; 20]).is_zero());
    }

    #[test]
    fn test_object_id_invalid_hex() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3ff").is_err());
        assert!(ObjectId::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn test_object_id_from_slice() {
        let id = ObjectId::from_slice(&[7u8; 20]).unwrap();
        assert_eq!(*id.as_bytes(), [7u8; 20]);
        assert!(ObjectId::from_slice(&[7u8; 19]).is_err());
    }

    #[test]
    fn test_object_id_serde() {
        let id = ObjectId::from_bytes([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_object_type_pack_type_roundtrip() {
        for ot in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::from_pack_type(ot.pack_type()).unwrap(), ot);
            assert_eq!(ObjectType::parse(ot.as_str()).unwrap(), ot);
        }
        assert!(ObjectType::from_pack_type(6).is_err());
        assert!(ObjectType::parse("invalid").is_err());
    }

    #[test]
    fn test_parse_commit() {
        let tree_id = ObjectId::from_bytes([1u8; 20]);
        let parents = vec![
            ObjectId::from_bytes([2u8; 20]),
            ObjectId::from_bytes([3u8; 20]),
        ];
        let author = "Alice <alice@example.com> 1234567890 +0000";

        let obj = GitObject::commit(&tree_id, &parents, author, author, "Merge\n\nparent body\n");
        let info = obj.parse_commit().unwrap();

        assert_eq!(info.tree, tree_id);
        assert_eq!(info.parents, parents);
    }

    #[test]
    fn test_parse_commit_ignores_message() {
        let tree_id = ObjectId::from_bytes([1u8; 20]);
        let message = format!("tree {}\n", ObjectId::from_bytes([9u8; 20]));
        let obj = GitObject::commit(&tree_id, &[], "a", "a", &message);

        assert_eq!(obj.parse_commit().unwrap().tree, tree_id);
    }

    #[test]
    fn test_parse_commit_without_tree() {
        let obj = GitObject::new(ObjectType::Commit, b"author a\n\nmsg".to_vec());
        assert!(obj.parse_commit().is_err());
    }

    #[test]
    fn test_parse_commit_wrong_type() {
        let obj = GitObject::blob(b"tree x".to_vec());
        assert!(obj.parse_commit().is_err());
    }

    #[test]
    fn test_tree_roundtrip() {
        let blob = GitObject::blob(b"content".to_vec());
        let sub = GitObject::tree(&[(0o100644, "inner.txt", blob.id)]);
        let tree = GitObject::tree(&[
            (0o100644, "file.txt", blob.id),
            (TreeEntry::MODE_TREE, "dir", sub.id),
        ]);

        let entries = tree.parse_tree().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file.txt");
        assert_eq!(entries[0].id, blob.id);
        assert!(!entries[0].is_tree());
        assert!(entries[1].is_tree());
        assert_eq!(entries[1].id, sub.id);
    }

    #[test]
    fn test_parse_tree_truncated() {
        let mut data = b"100644 file\0".to_vec();
        data.extend_from_slice(&[1u8; 10]);
        let tree = GitObject::new(ObjectType::Tree, data);
        assert!(tree.parse_tree().is_err());
    }

    #[test]
    fn test_parse_empty_tree() {
        let tree = GitObject::tree(&[]);
        assert!(tree.parse_tree().unwrap().is_empty());
        assert_eq!(tree.id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_parse_tag() {
        let target = ObjectId::from_bytes([4u8; 20]);
        let tagger = "Alice <a@b> 0 +0000";
        let tag = GitObject::tag(&target, ObjectType::Commit, "v1.0", tagger, "release");
        let info = tag.parse_tag().unwrap();

        assert_eq!(info.object, target);
        assert_eq!(info.object_type, ObjectType::Commit);
        assert_eq!(info.name, "v1.0");
    }

    #[test]
    fn test_parse_tag_incomplete() {
        let tag = GitObject::new(ObjectType::Tag, b"object 0000\n\n".to_vec());
        assert!(tag.parse_tag().is_err());
    }

    #[test]
    fn test_git_object_empty_blob() {
        let obj = GitObject::blob(b"".to_vec());
        assert_eq!(obj.size(), 0);
        assert_eq!(obj.id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }
}
