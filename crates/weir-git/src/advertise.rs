//! The ref snapshot a session works against, and its advertisement.

use crate::pktline::PktLineWriter;
use crate::Result;
use std::collections::BTreeMap;
use std::io::Write;
use weir_storage::{ObjectId, Repository};

/// Placeholder ref name advertised by an empty repository.
const CAPABILITIES_REF: &str = "capabilities^{}";

/// Refs as they were when the session started.
///
/// A symbolic `HEAD` is left out (the branch it names is listed on its own);
/// a detached `HEAD` is kept. Other symbolic refs map to the id they resolve
/// to, or to `None` when their target is unborn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisedRefs {
    refs: BTreeMap<String, Option<ObjectId>>,
    additional_haves: Vec<ObjectId>,
}

impl AdvertisedRefs {
    /// Takes a snapshot of `repo`.
    pub fn from_repository(repo: &Repository) -> Self {
        let refs = repo
            .refs
            .snapshot()
            .into_iter()
            .filter(|(name, (reference, _))| !(name == "HEAD" && reference.is_symbolic()))
            .map(|(name, (_, id))| (name, id))
            .collect();
        Self {
            refs,
            additional_haves: repo.additional_haves(),
        }
    }

    /// Builds a snapshot from explicit values.
    pub fn from_refs(
        refs: impl IntoIterator<Item = (String, Option<ObjectId>)>,
        additional_haves: impl IntoIterator<Item = ObjectId>,
    ) -> Self {
        Self {
            refs: refs.into_iter().collect(),
            additional_haves: additional_haves.into_iter().collect(),
        }
    }

    /// Returns true if the ref was advertised, even without a value.
    pub fn contains(&self, name: &str) -> bool {
        self.refs.contains_key(name)
    }

    /// Value of an advertised ref. `None` for absent and unborn refs alike.
    pub fn id(&self, name: &str) -> Option<ObjectId> {
        self.refs.get(name).copied().flatten()
    }

    /// Number of advertised refs.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns true if nothing was advertised.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Every id the server is known to have: ref values and additional
    /// haves, without duplicates.
    pub fn haves(&self) -> Vec<ObjectId> {
        let mut haves: Vec<ObjectId> = self
            .refs
            .values()
            .flatten()
            .copied()
            .chain(self.additional_haves.iter().copied())
            .collect();
        haves.sort();
        haves.dedup();
        haves
    }

    /// Writes the advertisement: one line per ref with a value (the first
    /// carrying the capabilities), `.have` lines, then a flush.
    pub fn write<W: Write>(&self, writer: &mut PktLineWriter<W>, capabilities: &[String]) -> Result<()> {
        let caps = capabilities.join(" ");
        let mut first = true;
        for (name, id) in &self.refs {
            let Some(id) = id else { continue };
            if first {
                writer.write_line(&format!("{} {}\0{}", id, name, caps))?;
                first = false;
            } else {
                writer.write_line(&format!("{} {}", id, name))?;
            }
        }
        if first {
            writer.write_line(&format!("{} {}\0{}", ObjectId::ZERO, CAPABILITIES_REF, caps))?;
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.additional_haves {
            if seen.insert(*id) {
                writer.write_line(&format!("{} .have", id))?;
            }
        }
        writer.flush_pkt()?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineReader;
    use std::io::Cursor;

    fn id(n: u8) -> ObjectId {
        ObjectId::from_bytes([n; 20])
    }

    fn lines(buf: Vec<u8>) -> Vec<String> {
        let mut reader = PktLineReader::new(Cursor::new(buf));
        let mut out = Vec::new();
        while let Some(line) = reader.read_string().unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_snapshot_skips_symbolic_head() {
        let repo = Repository::new("r");
        repo.refs.set("refs/heads/main", id(1));
        repo.refs.set_symbolic("refs/remotes/origin/HEAD", "refs/heads/gone");

        let refs = AdvertisedRefs::from_repository(&repo);
        assert!(!refs.contains("HEAD"));
        assert_eq!(refs.id("refs/heads/main"), Some(id(1)));
        assert!(refs.contains("refs/remotes/origin/HEAD"));
        assert_eq!(refs.id("refs/remotes/origin/HEAD"), None);
    }

    #[test]
    fn test_snapshot_keeps_detached_head() {
        let repo = Repository::new("r");
        repo.refs.set("HEAD", id(2));
        let refs = AdvertisedRefs::from_repository(&repo);
        assert_eq!(refs.id("HEAD"), Some(id(2)));
    }

    #[test]
    fn test_haves_include_additional() {
        let repo = Repository::new("r");
        repo.refs.set("refs/heads/a", id(1));
        repo.refs.set("refs/heads/b", id(1));
        repo.add_additional_have(id(3));
        let refs = AdvertisedRefs::from_repository(&repo);
        assert_eq!(refs.haves(), vec![id(1), id(3)]);
    }

    #[test]
    fn test_write_advertisement() {
        let refs = AdvertisedRefs::from_refs(
            [
                ("refs/heads/main".to_string(), Some(id(1))),
                ("refs/tags/v1".to_string(), Some(id(2))),
                ("refs/heads/unborn".to_string(), None),
            ],
            [id(9)],
        );
        let mut buf = Vec::new();
        refs.write(&mut PktLineWriter::new(&mut buf), &["report-status".to_string(), "delete-refs".to_string()])
            .unwrap();

        let lines = lines(buf);
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            format!("{} refs/heads/main\0report-status delete-refs", id(1))
        );
        assert_eq!(lines[1], format!("{} refs/tags/v1", id(2)));
        assert_eq!(lines[2], format!("{} .have", id(9)));
    }

    #[test]
    fn test_write_empty_repository() {
        let refs = AdvertisedRefs::default();
        let mut buf = Vec::new();
        refs.write(&mut PktLineWriter::new(&mut buf), &["report-status".to_string()])
            .unwrap();
        assert_eq!(
            lines(buf),
            vec![format!("{} capabilities^{{}}\0report-status", ObjectId::ZERO)]
        );
    }
}
