//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format
//!
//! [`PackParser`] reads a pack straight off the connection: the client keeps
//! the socket open to read the status report, so the parser consumes exactly
//! the bytes of the pack and never waits for end of input.

use crate::delta::apply_delta;
use crate::fsck::ObjectChecker;
use crate::{GitError, Result};
use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use weir_storage::{GitObject, ObjectId, ObjectStore, ObjectType};

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we support.
const PACK_VERSION: u32 = 2;
/// Pack type code of an offset delta.
const OFS_DELTA: u8 = 6;
/// Pack type code of a delta against an object named by id.
const REF_DELTA: u8 = 7;

/// Builds a pack file from a set of objects.
#[derive(Debug, Default)]
pub struct PackBuilder {
    entries: Vec<BuilderEntry>,
}

#[derive(Debug)]
enum BuilderEntry {
    Whole(GitObject),
    RefDelta { base: ObjectId, delta: Vec<u8> },
    OfsDelta { base_index: usize, delta: Vec<u8> },
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.entries.push(BuilderEntry::Whole(object));
    }

    /// Adds an object from the store by ID.
    pub fn add_from_store(&mut self, store: &ObjectStore, id: &ObjectId) -> Result<()> {
        let object = store.get(id)?;
        self.add(object);
        Ok(())
    }

    /// Adds a delta against an object named by id, which may live outside
    /// the pack (a thin pack).
    pub fn add_ref_delta(&mut self, base: ObjectId, delta: Vec<u8>) {
        self.entries.push(BuilderEntry::RefDelta { base, delta });
    }

    /// Adds a delta against an earlier entry of this pack.
    pub fn add_ofs_delta(&mut self, base_index: usize, delta: Vec<u8>) -> Result<()> {
        if base_index >= self.entries.len() {
            return Err(GitError::InvalidPack(format!(
                "delta base {} is not an earlier entry",
                base_index
            )));
        }
        self.entries.push(BuilderEntry::OfsDelta { base_index, delta });
        Ok(())
    }

    /// Number of entries added so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entry was added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the pack file.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();

        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        let mut offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let offset = pack.len();
            offsets.push(offset);
            match entry {
                BuilderEntry::Whole(object) => {
                    write_entry_header(&mut pack, object.object_type.pack_type(), object.size());
                    write_compressed(&mut pack, &object.data)?;
                }
                BuilderEntry::RefDelta { base, delta } => {
                    write_entry_header(&mut pack, REF_DELTA, delta.len());
                    pack.extend_from_slice(base.as_bytes());
                    write_compressed(&mut pack, delta)?;
                }
                BuilderEntry::OfsDelta { base_index, delta } => {
                    write_entry_header(&mut pack, OFS_DELTA, delta.len());
                    write_ofs_distance(&mut pack, (offset - offsets[*base_index]) as u64);
                    write_compressed(&mut pack, delta)?;
                }
            }
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);
        Ok(pack)
    }
}

/// Type and size header: `(MSB=more) (3 bits type) (4 bits size)`, then
/// 7 bits of size per byte.
fn write_entry_header(pack: &mut Vec<u8>, type_code: u8, size: usize) {
    let mut first_byte = (type_code << 4) | ((size & 0x0F) as u8);
    let mut remaining_size = size >> 4;
    if remaining_size > 0 {
        first_byte |= 0x80;
    }
    pack.push(first_byte);

    while remaining_size > 0 {
        let mut byte = (remaining_size & 0x7F) as u8;
        remaining_size >>= 7;
        if remaining_size > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

/// Big-endian base-128 with an implicit +1 per continuation byte.
fn write_ofs_distance(pack: &mut Vec<u8>, mut distance: u64) {
    let mut bytes = vec![(distance & 0x7F) as u8];
    distance >>= 7;
    while distance > 0 {
        distance -= 1;
        bytes.push(0x80 | (distance & 0x7F) as u8);
        distance >>= 7;
    }
    bytes.reverse();
    pack.extend_from_slice(&bytes);
}

fn write_compressed(pack: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| GitError::InvalidPack(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| GitError::InvalidPack(e.to_string()))?;
    pack.extend_from_slice(&compressed);
    Ok(())
}

/// Objects recovered from a pack.
#[derive(Debug, Default)]
pub struct ReceivedPack {
    /// Every object of the pack, deltas resolved, in pack order.
    pub objects: Vec<GitObject>,
    /// Delta bases taken from the repository rather than from the pack.
    pub base_objects: Vec<ObjectId>,
    /// Size of the pack in bytes.
    pub pack_size: u64,
}

impl ReceivedPack {
    /// Ids of the objects the pack provided.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.iter().map(|o| o.id)
    }
}

/// Parses a pack file and extracts objects.
pub struct PackParser<'a> {
    store: &'a ObjectStore,
    max_pack_size: Option<u64>,
    max_object_size: Option<u64>,
    allow_ofs_delta: bool,
    checker: Option<ObjectChecker>,
}

impl std::fmt::Debug for PackParser<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackParser")
            .field("max_pack_size", &self.max_pack_size)
            .field("max_object_size", &self.max_object_size)
            .field("allow_ofs_delta", &self.allow_ofs_delta)
            .field("checker", &self.checker.is_some())
            .finish()
    }
}

/// A pack entry as read, before delta resolution.
enum Entry {
    Whole(ObjectType, Vec<u8>),
    Delta(DeltaBase, Vec<u8>),
}

#[derive(Clone, Copy)]
enum DeltaBase {
    /// Index of an earlier entry.
    Entry(usize),
    /// Object named by id, in the pack or in the store.
    Id(ObjectId),
}

impl<'a> PackParser<'a> {
    /// Creates a parser that resolves thin-pack bases against `store`.
    pub fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            max_pack_size: None,
            max_object_size: None,
            allow_ofs_delta: true,
            checker: None,
        }
    }

    /// Limits the size of the whole pack.
    pub fn max_pack_size(mut self, limit: Option<u64>) -> Self {
        self.max_pack_size = limit;
        self
    }

    /// Limits the inflated size of each object.
    pub fn max_object_size(mut self, limit: Option<u64>) -> Self {
        self.max_object_size = limit;
        self
    }

    /// Refuses offset deltas when the client did not negotiate them.
    pub fn allow_ofs_delta(mut self, allow: bool) -> Self {
        self.allow_ofs_delta = allow;
        self
    }

    /// Checks every resolved object with `checker`.
    pub fn checker(mut self, checker: Option<ObjectChecker>) -> Self {
        self.checker = checker;
        self
    }

    /// Reads one pack from `input`.
    ///
    /// Objects are returned, not stored; the caller decides whether to keep
    /// them.
    pub fn parse<R: Read>(&self, input: R) -> Result<ReceivedPack> {
        let mut input = PackInput::new(input);

        let mut header = [0u8; 12];
        read_exact(&mut input, &mut header, "pack header")?;
        if &header[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != PACK_VERSION {
            return Err(GitError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let mut entries = Vec::with_capacity(count.min(1024));
        let mut offsets: HashMap<u64, usize> = HashMap::new();
        for index in 0..count {
            let offset = input.consumed;
            offsets.insert(offset, index);
            let entry = self.read_entry(&mut input, offset, &offsets)?;
            entries.push(entry);
            self.check_pack_size(input.consumed)?;
        }

        let computed = input.hasher.clone().finalize();
        let mut trailer = [0u8; 20];
        read_exact(&mut input, &mut trailer, "pack checksum")?;
        if computed.as_slice() != &trailer[..] {
            return Err(GitError::InvalidPack("checksum mismatch".to_string()));
        }
        self.check_pack_size(input.consumed)?;

        let mut pack = self.resolve(entries)?;
        pack.pack_size = input.consumed;

        if let Some(checker) = &self.checker {
            for object in &pack.objects {
                checker.check(object)?;
            }
        }

        tracing::debug!(
            objects = pack.objects.len(),
            bases = pack.base_objects.len(),
            bytes = pack.pack_size,
            "pack parsed"
        );
        Ok(pack)
    }

    fn check_pack_size(&self, consumed: u64) -> Result<()> {
        match self.max_pack_size {
            Some(limit) if consumed > limit => Err(GitError::PackTooLarge { limit }),
            _ => Ok(()),
        }
    }

    fn check_object_size(&self, size: u64) -> Result<()> {
        match self.max_object_size {
            Some(limit) if size > limit => Err(GitError::ObjectTooLarge { size, limit }),
            _ => Ok(()),
        }
    }

    fn read_entry<R: Read>(
        &self,
        input: &mut PackInput<R>,
        offset: u64,
        offsets: &HashMap<u64, usize>,
    ) -> Result<Entry> {
        let first_byte = read_byte(input)?;
        let type_code = (first_byte >> 4) & 0x07;
        let mut size = (first_byte & 0x0F) as u64;
        let mut shift = 4;
        let mut byte = first_byte;
        while byte & 0x80 != 0 {
            byte = read_byte(input)?;
            if shift > 57 {
                return Err(GitError::InvalidPack("object size overflows".to_string()));
            }
            size |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
        }
        // Delta payloads are bounded too; inflation allocates `size` bytes.
        self.check_object_size(size)?;

        match type_code {
            OFS_DELTA => {
                if !self.allow_ofs_delta {
                    return Err(GitError::InvalidPack(
                        "offset delta without ofs-delta capability".to_string(),
                    ));
                }
                let distance = read_ofs_distance(input)?;
                let base_offset = offset.checked_sub(distance).ok_or_else(|| {
                    GitError::InvalidPack(format!("delta base offset before pack start at {}", offset))
                })?;
                let base = *offsets.get(&base_offset).ok_or_else(|| {
                    GitError::InvalidPack(format!("no object at delta base offset {}", base_offset))
                })?;
                Ok(Entry::Delta(DeltaBase::Entry(base), inflate(input, size)?))
            }
            REF_DELTA => {
                let mut raw = [0u8; 20];
                read_exact(input, &mut raw, "delta base id")?;
                let base = DeltaBase::Id(ObjectId::from_bytes(raw));
                Ok(Entry::Delta(base, inflate(input, size)?))
            }
            code => {
                let object_type = ObjectType::from_pack_type(code)
                    .map_err(|_| GitError::InvalidPack(format!("invalid object type {}", code)))?;
                Ok(Entry::Whole(object_type, inflate(input, size)?))
            }
        }
    }

    /// Resolves deltas in passes; bases missing from the pack are looked up
    /// in the store once no further progress is possible inside the pack.
    fn resolve(&self, entries: Vec<Entry>) -> Result<ReceivedPack> {
        let mut resolved: Vec<Option<GitObject>> = Vec::with_capacity(entries.len());
        let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
        let mut pending: Vec<(usize, DeltaBase, Vec<u8>)> = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                Entry::Whole(object_type, data) => {
                    let object = GitObject::new(object_type, data);
                    by_id.insert(object.id, index);
                    resolved.push(Some(object));
                }
                Entry::Delta(base, delta) => {
                    resolved.push(None);
                    pending.push((index, base, delta));
                }
            }
        }

        let mut base_objects: Vec<ObjectId> = Vec::new();
        let mut store_bases: HashMap<ObjectId, GitObject> = HashMap::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut still_pending = Vec::new();
            for (index, base_ref, delta) in pending {
                let base = match base_ref {
                    DeltaBase::Entry(i) => resolved[i].as_ref(),
                    DeltaBase::Id(id) => match by_id.get(&id) {
                        Some(&i) => resolved[i].as_ref(),
                        None => store_bases.get(&id),
                    },
                };
                let Some(base) = base else {
                    still_pending.push((index, base_ref, delta));
                    continue;
                };
                self.check_object_size(crate::delta::result_size(&delta)? as u64)?;
                let object = GitObject::new(base.object_type, apply_delta(&base.data, &delta)?);
                by_id.insert(object.id, index);
                resolved[index] = Some(object);
            }
            pending = still_pending;

            if pending.len() == before {
                // Stuck inside the pack: borrow the first missing base from
                // the repository and go around again.
                let missing = pending.iter().find_map(|(_, base, _)| match base {
                    DeltaBase::Id(id) if !by_id.contains_key(id) && !store_bases.contains_key(id) => {
                        Some(*id)
                    }
                    _ => None,
                });
                let Some(base_id) = missing else {
                    return Err(GitError::InvalidPack("unresolvable delta chain".to_string()));
                };
                let base = self.store.get(&base_id).map_err(|_| {
                    GitError::InvalidPack(format!("delta base {} not found", base_id))
                })?;
                base_objects.push(base_id);
                store_bases.insert(base_id, base);
            }
        }

        Ok(ReceivedPack {
            objects: resolved.into_iter().flatten().collect(),
            base_objects,
            pack_size: 0,
        })
    }
}

/// Buffered pack input that hashes and counts exactly the bytes consumed.
struct PackInput<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    hasher: Sha1,
    consumed: u64,
}

impl<R: Read> PackInput<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; 8192].into_boxed_slice(),
            pos: 0,
            filled: 0,
            hasher: Sha1::new(),
            consumed: 0,
        }
    }
}

impl<R: Read> Read for PackInput<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for PackInput<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        if self.pos >= self.filled {
            self.filled = self.inner.read(&mut self.buf)?;
            self.pos = 0;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.filled - self.pos);
        self.hasher.update(&self.buf[self.pos..self.pos + amt]);
        self.pos += amt;
        self.consumed += amt as u64;
    }
}

fn read_exact<R: Read>(input: &mut PackInput<R>, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            GitError::InvalidPack(format!("unexpected end of pack in {}", what))
        }
        _ => GitError::Io(e),
    })
}

fn read_byte<R: Read>(input: &mut PackInput<R>) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_exact(input, &mut byte, "entry header")?;
    Ok(byte[0])
}

fn read_ofs_distance<R: Read>(input: &mut PackInput<R>) -> Result<u64> {
    let mut byte = read_byte(input)?;
    let mut value = (byte & 0x7F) as u64;
    while byte & 0x80 != 0 {
        byte = read_byte(input)?;
        value = value
            .checked_add(1)
            .and_then(|v| v.checked_mul(128))
            .ok_or_else(|| GitError::InvalidPack("delta offset overflows".to_string()))?
            | (byte & 0x7F) as u64;
    }
    Ok(value)
}

/// Inflates one zlib stream that must produce exactly `size` bytes.
fn inflate<R: Read>(input: &mut PackInput<R>, size: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size.min(1 << 20) as usize);
    let mut decoder = ZlibDecoder::new(input);
    decoder
        .by_ref()
        .take(size + 1)
        .read_to_end(&mut data)
        .map_err(|e| GitError::InvalidPack(format!("decompression failed: {}", e)))?;
    if data.len() as u64 != size {
        return Err(GitError::InvalidPack(format!(
            "object inflated to {} bytes, header says {}",
            data.len(),
            size
        )));
    }
    Ok(data)
}
