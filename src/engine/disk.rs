//! Persistent disk index partition.
//!
//! Immutable segments plus a manifest carrying the committed version
//! watermark. Commit discipline: segment files are written first, then
//! the manifest goes through a tmp-file rename so a crash can never leave
//! a manifest pointing at half-written segments.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::docid::DocIdMapperFactory;
use crate::engine::analyzer::TermFrequencies;
use crate::engine::reader::{IndexReader, PartitionKind, SharedReader};
use crate::error::{FreshetError, Result};
use crate::event::Version;

pub const MANIFEST_FILE: &str = "segments.manifest";
const MANIFEST_TMP: &str = "segments.manifest.tmp";
const IMPORT_STAGING_DIR: &str = "import.tmp";

const SNAPSHOT_MAGIC: [u8; 4] = *b"FSNP";
const SNAPSHOT_FORMAT: u32 = 1;

/// Manifest format version (for upgrades)
pub const MANIFEST_FORMAT: u32 = 1;

/// Metadata for one on-disk segment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: u64,
    pub doc_count: u32,
    pub delete_count: u32,
    pub size_bytes: u64,
    pub max_version: Version,
    pub checksum: u32,
    /// Single-file encoding when true, docs/deletes file pair otherwise
    pub compound: bool,
}

/// The manifest tracks live segments and the committed version watermark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub format: u32,
    /// Incremented on every persisted update
    pub generation: u64,
    pub next_segment_id: u64,
    /// Committed version watermark
    pub version: Version,
    pub segments: Vec<SegmentMeta>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            format: MANIFEST_FORMAT,
            generation: 0,
            next_segment_id: 0,
            version: 0,
            segments: Vec::new(),
        }
    }

    /// Load the manifest from an index directory. `Ok(None)` when no
    /// manifest exists yet.
    pub fn load(dir: &Path) -> std::io::Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(manifest))
    }

    fn save(&self, dir: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = dir.join(MANIFEST_TMP);
        fs::write(&tmp, bytes)?;
        fs::rename(tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct SegmentPayload {
    docs: Vec<(u64, TermFrequencies)>,
    deletes: Vec<u64>,
}

/// One immutable segment held in memory
pub struct Segment {
    meta: SegmentMeta,
    docs: HashMap<u64, TermFrequencies>,
    deletes: HashSet<u64>,
}

impl Segment {
    fn build(
        id: u64,
        docs: HashMap<u64, TermFrequencies>,
        deletes: HashSet<u64>,
        max_version: Version,
        compound: bool,
    ) -> Self {
        let meta = SegmentMeta {
            id,
            doc_count: docs.len() as u32,
            delete_count: deletes.len() as u32,
            size_bytes: 0,
            max_version,
            checksum: 0,
            compound,
        };
        Self {
            meta,
            docs,
            deletes,
        }
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    fn payload(&self) -> SegmentPayload {
        SegmentPayload {
            docs: self.docs.iter().map(|(u, f)| (*u, f.clone())).collect(),
            deletes: self.deletes.iter().copied().collect(),
        }
    }
}

fn compound_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("segment_{}.seg", id))
}

fn docs_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("segment_{}.docs", id))
}

fn deletes_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("segment_{}.del", id))
}

fn checksum_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Serialize and write segment files; fills in size and checksum.
fn write_segment(dir: &Path, segment: &mut Segment) -> std::io::Result<()> {
    let id = segment.meta.id;
    if segment.meta.compound {
        let bytes = bincode::serialize(&segment.payload())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        segment.meta.checksum = checksum_of(&[&bytes]);
        segment.meta.size_bytes = bytes.len() as u64;
        fs::write(compound_path(dir, id), bytes)?;
    } else {
        let payload = segment.payload();
        let doc_bytes = bincode::serialize(&payload.docs)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let del_bytes = bincode::serialize(&payload.deletes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        segment.meta.checksum = checksum_of(&[&doc_bytes, &del_bytes]);
        segment.meta.size_bytes = (doc_bytes.len() + del_bytes.len()) as u64;
        fs::write(docs_path(dir, id), doc_bytes)?;
        fs::write(deletes_path(dir, id), del_bytes)?;
    }
    Ok(())
}

fn read_segment(dir: &Path, meta: &SegmentMeta) -> std::io::Result<Segment> {
    let (payload, checksum) = if meta.compound {
        let bytes = fs::read(compound_path(dir, meta.id))?;
        let checksum = checksum_of(&[&bytes]);
        let payload: SegmentPayload = bincode::deserialize(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        (payload, checksum)
    } else {
        let doc_bytes = fs::read(docs_path(dir, meta.id))?;
        let del_bytes = fs::read(deletes_path(dir, meta.id))?;
        let checksum = checksum_of(&[&doc_bytes, &del_bytes]);
        let docs: Vec<(u64, TermFrequencies)> = bincode::deserialize(&doc_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let deletes: Vec<u64> = bincode::deserialize(&del_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        (SegmentPayload { docs, deletes }, checksum)
    };
    if checksum != meta.checksum {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("segment {} checksum mismatch", meta.id),
        ));
    }
    let mut segment = Segment::build(
        meta.id,
        payload.docs.into_iter().collect(),
        payload.deletes.into_iter().collect(),
        meta.max_version,
        meta.compound,
    );
    segment.meta = meta.clone();
    Ok(segment)
}

fn remove_segment_files(dir: &Path, meta: &SegmentMeta) {
    let paths = if meta.compound {
        vec![compound_path(dir, meta.id)]
    } else {
        vec![docs_path(dir, meta.id), deletes_path(dir, meta.id)]
    };
    for path in paths {
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "could not remove segment file");
        }
    }
}

struct DiskState {
    manifest: Manifest,
    segments: Vec<Arc<Segment>>,
    published: Option<SharedReader>,
    dirty: bool,
}

/// The persistent index partition.
pub struct DiskIndex {
    dir: PathBuf,
    mapper_factory: Arc<dyn DocIdMapperFactory>,
    inner: RwLock<DiskState>,
}

impl DiskIndex {
    /// Open (or create) the disk partition at `dir`. A corrupt manifest
    /// is logged and the index starts empty; a segment named by a valid
    /// manifest that cannot be read back fails the open.
    pub fn open(dir: &Path, mapper_factory: Arc<dyn DocIdMapperFactory>) -> Result<Self> {
        fs::create_dir_all(dir).map_err(FreshetError::Engine)?;
        let manifest = match Manifest::load(dir) {
            Ok(Some(m)) if m.format == MANIFEST_FORMAT => m,
            Ok(Some(m)) => {
                error!(format = m.format, "unsupported manifest format; starting empty");
                Manifest::new()
            }
            Ok(None) => Manifest::new(),
            Err(e) => {
                error!(error = %e, "corrupt manifest; starting empty");
                Manifest::new()
            }
        };
        let mut segments = Vec::with_capacity(manifest.segments.len());
        for meta in &manifest.segments {
            segments.push(Arc::new(read_segment(dir, meta)?));
        }
        info!(
            path = %dir.display(),
            version = manifest.version,
            segments = segments.len(),
            "disk index opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            mapper_factory,
            inner: RwLock::new(DiskState {
                manifest,
                segments,
                published: None,
                dirty: true,
            }),
        })
    }

    /// Append one segment holding the given batch. Not yet durable until
    /// [`DiskIndex::commit`] persists the manifest.
    pub fn apply(
        &self,
        docs: Vec<(u64, TermFrequencies)>,
        deletes: Vec<u64>,
        version: Version,
        compound: bool,
    ) -> Result<()> {
        let id = {
            let mut state = self.inner.write();
            let id = state.manifest.next_segment_id;
            state.manifest.next_segment_id += 1;
            id
        };
        let mut segment = Segment::build(
            id,
            docs.into_iter().collect(),
            deletes.into_iter().collect(),
            version,
            compound,
        );
        write_segment(&self.dir, &mut segment)?;

        let mut state = self.inner.write();
        state.manifest.segments.push(segment.meta.clone());
        state.segments.push(Arc::new(segment));
        state.dirty = true;
        Ok(())
    }

    /// Advance the version watermark and persist the manifest atomically.
    pub fn commit(&self, version: Version) -> Result<()> {
        let mut state = self.inner.write();
        state.manifest.version = state.manifest.version.max(version);
        state.manifest.generation += 1;
        state.manifest.save(&self.dir)?;
        state.dirty = true;
        debug!(version = state.manifest.version, "disk commit");
        Ok(())
    }

    /// Merge segments down to at most `target_segments`, oldest first,
    /// bounded by `merge_factor` segments per pass and skipping passes
    /// that would exceed `max_merge_docs`.
    pub fn optimize(
        &self,
        target_segments: usize,
        merge_factor: usize,
        max_merge_docs: usize,
        compound: bool,
    ) -> Result<()> {
        let target = target_segments.max(1);
        loop {
            let snapshot: Vec<Arc<Segment>> = {
                let state = self.inner.read();
                if state.segments.len() <= target {
                    return Ok(());
                }
                state.segments.clone()
            };
            let fan_in = (snapshot.len() - target + 1).min(merge_factor.max(2));
            let to_merge = &snapshot[..fan_in];
            let total_docs: usize = to_merge.iter().map(|s| s.docs.len()).sum();
            if total_docs > max_merge_docs {
                debug!(total_docs, max_merge_docs, "merge pass skipped");
                return Ok(());
            }

            let mut docs: HashMap<u64, TermFrequencies> = HashMap::new();
            let mut max_version = 0;
            for seg in to_merge {
                for uid in &seg.deletes {
                    docs.remove(uid);
                }
                for (uid, freqs) in &seg.docs {
                    docs.insert(*uid, freqs.clone());
                }
                max_version = max_version.max(seg.meta.max_version);
            }

            let id = {
                let mut state = self.inner.write();
                let id = state.manifest.next_segment_id;
                state.manifest.next_segment_id += 1;
                id
            };
            // merging the oldest prefix leaves nothing for its deletes to mask
            let mut merged = Segment::build(id, docs, HashSet::new(), max_version, compound);
            write_segment(&self.dir, &mut merged)?;

            let removed: Vec<SegmentMeta> = {
                let mut state = self.inner.write();
                let removed: Vec<SegmentMeta> = state.segments[..fan_in]
                    .iter()
                    .map(|s| s.meta.clone())
                    .collect();
                let mut segments: Vec<Arc<Segment>> = vec![Arc::new(merged)];
                segments.extend_from_slice(&state.segments[fan_in..]);
                state.manifest.segments = segments.iter().map(|s| s.meta.clone()).collect();
                state.segments = segments;
                state.manifest.generation += 1;
                state.manifest.save(&self.dir)?;
                state.dirty = true;
                removed
            };
            for meta in &removed {
                remove_segment_files(&self.dir, meta);
            }
            info!(fan_in, "merged segments");
        }
    }

    /// Rewrite segments dropping every tombstoned document.
    pub fn expunge_deletes(&self) -> Result<()> {
        let snapshot: Vec<Arc<Segment>> = self.inner.read().segments.clone();
        if snapshot.is_empty() {
            return Ok(());
        }

        // masked[i] = uids deleted by any segment newer than i
        let mut masked: HashSet<u64> = HashSet::new();
        let mut replacements: Vec<Option<Segment>> = vec![];
        for seg in snapshot.iter().rev() {
            let dropped: Vec<u64> = seg
                .docs
                .keys()
                .filter(|uid| masked.contains(*uid))
                .copied()
                .collect();
            let needs_rewrite = !seg.deletes.is_empty() || !dropped.is_empty();
            masked.extend(seg.deletes.iter().copied());
            if needs_rewrite {
                let mut docs = seg.docs.clone();
                for uid in &dropped {
                    docs.remove(uid);
                }
                replacements.push(Some(Segment::build(
                    0, // id assigned below
                    docs,
                    HashSet::new(),
                    seg.meta.max_version,
                    seg.meta.compound,
                )));
            } else {
                replacements.push(None);
            }
        }
        replacements.reverse();

        if replacements.iter().all(Option::is_none) {
            return Ok(());
        }

        let mut removed = Vec::new();
        let mut rebuilt: Vec<Arc<Segment>> = Vec::with_capacity(snapshot.len());
        for (old, replacement) in snapshot.iter().zip(replacements) {
            match replacement {
                Some(mut segment) => {
                    segment.meta.id = {
                        let mut state = self.inner.write();
                        let id = state.manifest.next_segment_id;
                        state.manifest.next_segment_id += 1;
                        id
                    };
                    write_segment(&self.dir, &mut segment)?;
                    removed.push(old.meta.clone());
                    rebuilt.push(Arc::new(segment));
                }
                None => rebuilt.push(old.clone()),
            }
        }

        {
            let mut state = self.inner.write();
            state.manifest.segments = rebuilt.iter().map(|s| s.meta.clone()).collect();
            state.segments = rebuilt;
            state.manifest.generation += 1;
            state.manifest.save(&self.dir)?;
            state.dirty = true;
        }
        for meta in &removed {
            remove_segment_files(&self.dir, meta);
        }
        info!(rewritten = removed.len(), "expunged deletes");
        Ok(())
    }

    /// Delete every segment and reset the watermark to zero.
    pub fn purge(&self) -> Result<()> {
        let mut state = self.inner.write();
        let old: Vec<SegmentMeta> = state.segments.iter().map(|s| s.meta.clone()).collect();
        state.segments.clear();
        state.manifest = Manifest::new();
        state.manifest.save(&self.dir)?;
        state.dirty = true;
        drop(state);
        for meta in &old {
            remove_segment_files(&self.dir, meta);
        }
        info!("disk index purged");
        Ok(())
    }

    /// Stream a consistent snapshot of the whole partition.
    pub fn export_snapshot(&self, out: &mut dyn Write) -> Result<()> {
        let (manifest, segments) = {
            let state = self.inner.read();
            (state.manifest.clone(), state.segments.clone())
        };
        out.write_all(&SNAPSHOT_MAGIC)?;
        out.write_all(&SNAPSHOT_FORMAT.to_le_bytes())?;
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.write_all(&(manifest_bytes.len() as u64).to_le_bytes())?;
        out.write_all(&manifest_bytes)?;
        out.write_all(&(segments.len() as u32).to_le_bytes())?;
        for segment in &segments {
            let payload = bincode::serialize(&segment.payload())?;
            out.write_all(&segment.meta.id.to_le_bytes())?;
            out.write_all(&(payload.len() as u64).to_le_bytes())?;
            out.write_all(&payload)?;
            out.write_all(&checksum_of(&[&payload]).to_le_bytes())?;
        }
        out.flush()?;
        info!(segments = segments.len(), version = manifest.version, "snapshot exported");
        Ok(())
    }

    /// Replace the partition contents from an exported snapshot. The
    /// stream is fully validated in memory before any on-disk state is
    /// touched; a corrupt snapshot leaves the index unchanged.
    pub fn import_snapshot(&self, input: &mut dyn Read) -> Result<()> {
        let mut magic = [0u8; 4];
        read_exact(input, &mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(FreshetError::InvalidSnapshot("bad magic".to_string()));
        }
        let format = read_u32(input)?;
        if format != SNAPSHOT_FORMAT {
            return Err(FreshetError::InvalidSnapshot(format!(
                "unsupported snapshot format {}",
                format
            )));
        }
        let manifest_len = read_u64(input)? as usize;
        let mut manifest_bytes = vec![0u8; manifest_len];
        read_exact(input, &mut manifest_bytes)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| FreshetError::InvalidSnapshot(format!("manifest: {}", e)))?;
        let segment_count = read_u32(input)? as usize;
        if segment_count != manifest.segments.len() {
            return Err(FreshetError::InvalidSnapshot(
                "segment count does not match manifest".to_string(),
            ));
        }

        let mut segments: Vec<Segment> = Vec::with_capacity(segment_count);
        for meta in &manifest.segments {
            let id = read_u64(input)?;
            if id != meta.id {
                return Err(FreshetError::InvalidSnapshot(format!(
                    "segment id {} out of order",
                    id
                )));
            }
            let len = read_u64(input)? as usize;
            let mut payload = vec![0u8; len];
            read_exact(input, &mut payload)?;
            let checksum = read_u32(input)?;
            if checksum != checksum_of(&[&payload]) {
                return Err(FreshetError::InvalidSnapshot(format!(
                    "segment {} checksum mismatch",
                    id
                )));
            }
            let payload: SegmentPayload = bincode::deserialize(&payload)
                .map_err(|e| FreshetError::InvalidSnapshot(format!("segment {}: {}", id, e)))?;
            let mut segment = Segment::build(
                meta.id,
                payload.docs.into_iter().collect(),
                payload.deletes.into_iter().collect(),
                meta.max_version,
                meta.compound,
            );
            segment.meta.delete_count = meta.delete_count;
            segments.push(segment);
        }

        // stage the replacement files before touching live state
        let staging = self.dir.join(IMPORT_STAGING_DIR);
        let _ = fs::remove_dir_all(&staging);
        fs::create_dir_all(&staging)?;
        let mut new_manifest = manifest.clone();
        new_manifest.segments.clear();
        for segment in &mut segments {
            write_segment(&staging, segment)?;
            new_manifest.segments.push(segment.meta.clone());
        }

        let mut state = self.inner.write();
        let old: Vec<SegmentMeta> = state.segments.iter().map(|s| s.meta.clone()).collect();
        for meta in &old {
            remove_segment_files(&self.dir, meta);
        }
        for segment in &segments {
            let (from, to) = if segment.meta.compound {
                (
                    compound_path(&staging, segment.meta.id),
                    compound_path(&self.dir, segment.meta.id),
                )
            } else {
                // move both files of the pair
                fs::rename(
                    deletes_path(&staging, segment.meta.id),
                    deletes_path(&self.dir, segment.meta.id),
                )?;
                (
                    docs_path(&staging, segment.meta.id),
                    docs_path(&self.dir, segment.meta.id),
                )
            };
            fs::rename(from, to)?;
        }
        new_manifest.generation = state.manifest.generation + 1;
        new_manifest.save(&self.dir)?;
        let version = new_manifest.version;
        state.manifest = new_manifest;
        state.segments = segments.into_iter().map(Arc::new).collect();
        state.dirty = true;
        drop(state);
        let _ = fs::remove_dir_all(&staging);
        info!(version, "snapshot imported");
        Ok(())
    }

    /// Borrow the current reader, republishing first if state changed.
    /// The returned handle is already `inc_ref`'d for the caller.
    pub fn reader(&self) -> SharedReader {
        let mut guard = self.inner.write();
        let state = &mut *guard;
        if state.dirty || state.published.is_none() {
            let mut live: HashMap<u64, &TermFrequencies> = HashMap::new();
            for segment in &state.segments {
                for uid in &segment.deletes {
                    live.remove(uid);
                }
                for (uid, freqs) in &segment.docs {
                    live.insert(*uid, freqs);
                }
            }
            let uids: Vec<u64> = live.keys().copied().collect();
            let mut postings: HashMap<String, Vec<u64>> = HashMap::new();
            for (uid, freqs) in &live {
                for term in freqs.keys() {
                    postings.entry(term.clone()).or_default().push(*uid);
                }
            }
            for uids in postings.values_mut() {
                uids.sort_unstable();
            }
            let reader = IndexReader::publish(
                PartitionKind::Disk,
                state.manifest.version,
                state.segments.len(),
                uids,
                postings,
                HashSet::new(),
                self.mapper_factory.as_ref(),
            );
            if let Some(old) = state.published.replace(reader) {
                old.dec_ref();
            }
            state.dirty = false;
        }
        let reader = state.published.as_ref().expect("reader just published");
        reader.inc_ref();
        reader.clone()
    }

    /// Force the next reader borrow to republish.
    pub fn republish(&self) {
        self.inner.write().dirty = true;
    }

    pub fn version(&self) -> Version {
        self.inner.read().manifest.version
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    /// Live documents after tombstone masking.
    pub fn live_doc_count(&self) -> usize {
        let state = self.inner.read();
        let mut live: HashSet<u64> = HashSet::new();
        for segment in &state.segments {
            for uid in &segment.deletes {
                live.remove(uid);
            }
            live.extend(segment.docs.keys().copied());
        }
        live.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner
            .read()
            .segments
            .iter()
            .map(|s| s.meta.size_bytes)
            .sum()
    }

    /// Release the published reader's owner reference.
    pub fn close(&self) {
        let mut state = self.inner.write();
        if let Some(old) = state.published.take() {
            old.dec_ref();
        }
        state.dirty = true;
    }
}

fn read_exact(input: &mut dyn Read, buf: &mut [u8]) -> Result<()> {
    input
        .read_exact(buf)
        .map_err(|_| FreshetError::InvalidSnapshot("truncated stream".to_string()))
}

fn read_u32(input: &mut dyn Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(input, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(input: &mut dyn Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(input, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docid::DefaultDocIdMapperFactory;
    use crate::engine::analyzer::{Analyzer, SimpleAnalyzer};
    use tempfile::TempDir;

    fn doc(content: &str) -> TermFrequencies {
        SimpleAnalyzer.term_frequencies(content)
    }

    fn open(dir: &Path) -> DiskIndex {
        DiskIndex::open(dir, Arc::new(DefaultDocIdMapperFactory)).unwrap()
    }

    #[test]
    fn test_apply_commit_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let disk = open(tmp.path());
            disk.apply(vec![(1, doc("rust")), (2, doc("search"))], vec![], 2, true)
                .unwrap();
            disk.commit(2).unwrap();
            assert_eq!(disk.version(), 2);
        }

        let disk = open(tmp.path());
        assert_eq!(disk.version(), 2);
        assert_eq!(disk.segment_count(), 1);
        assert_eq!(disk.live_doc_count(), 2);

        let reader = disk.reader();
        assert_eq!(reader.uids(), &[1, 2]);
        assert_eq!(reader.doc_frequency("rust"), 1);
        reader.dec_ref();
        disk.close();
    }

    #[test]
    fn test_uncommitted_segment_not_in_manifest() {
        let tmp = TempDir::new().unwrap();
        {
            let disk = open(tmp.path());
            disk.apply(vec![(1, doc("a"))], vec![], 1, true).unwrap();
            // no commit
        }
        let disk = open(tmp.path());
        assert_eq!(disk.segment_count(), 0);
        assert_eq!(disk.version(), 0);
    }

    #[test]
    fn test_tombstone_masks_older_segment() {
        let tmp = TempDir::new().unwrap();
        let disk = open(tmp.path());
        disk.apply(vec![(1, doc("a")), (2, doc("b"))], vec![], 2, true)
            .unwrap();
        disk.apply(vec![(3, doc("c"))], vec![2], 3, true).unwrap();
        disk.commit(3).unwrap();

        assert_eq!(disk.live_doc_count(), 2);
        let reader = disk.reader();
        assert_eq!(reader.uids(), &[1, 3]);
        reader.dec_ref();
        disk.close();
    }

    #[test]
    fn test_optimize_merges_down() {
        let tmp = TempDir::new().unwrap();
        let disk = open(tmp.path());
        for i in 0..6u64 {
            disk.apply(vec![(i, doc("term"))], vec![], i + 1, true).unwrap();
        }
        disk.commit(6).unwrap();
        assert_eq!(disk.segment_count(), 6);

        disk.optimize(2, 10, usize::MAX, true).unwrap();
        assert_eq!(disk.segment_count(), 2);
        assert_eq!(disk.live_doc_count(), 6);

        // survives reopen
        drop(disk);
        let disk = open(tmp.path());
        assert_eq!(disk.segment_count(), 2);
        assert_eq!(disk.live_doc_count(), 6);
        disk.close();
    }

    #[test]
    fn test_expunge_drops_tombstoned_docs() {
        let tmp = TempDir::new().unwrap();
        let disk = open(tmp.path());
        disk.apply(vec![(1, doc("a")), (2, doc("b"))], vec![], 2, true)
            .unwrap();
        disk.apply(vec![], vec![1], 3, true).unwrap();
        disk.commit(3).unwrap();

        disk.expunge_deletes().unwrap();
        assert_eq!(disk.live_doc_count(), 1);
        let state_docs: u32 = disk
            .inner
            .read()
            .segments
            .iter()
            .map(|s| s.docs.len() as u32)
            .sum();
        assert_eq!(state_docs, 1);
        disk.close();
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();

        let src = open(src_dir.path());
        src.apply(vec![(1, doc("alpha")), (2, doc("beta"))], vec![], 5, true)
            .unwrap();
        src.commit(5).unwrap();

        let mut buf = Vec::new();
        src.export_snapshot(&mut buf).unwrap();

        let dst = open(dst_dir.path());
        dst.import_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(dst.version(), 5);
        assert_eq!(dst.live_doc_count(), 2);

        let reader = dst.reader();
        assert_eq!(reader.uids(), &[1, 2]);
        reader.dec_ref();
        src.close();
        dst.close();
    }

    #[test]
    fn test_corrupt_snapshot_leaves_state_unchanged() {
        let tmp = TempDir::new().unwrap();
        let disk = open(tmp.path());
        disk.apply(vec![(1, doc("keep"))], vec![], 1, true).unwrap();
        disk.commit(1).unwrap();

        let err = disk
            .import_snapshot(&mut &b"not a snapshot"[..])
            .unwrap_err();
        assert!(matches!(err, FreshetError::InvalidSnapshot(_)));
        assert_eq!(disk.version(), 1);
        assert_eq!(disk.live_doc_count(), 1);
        disk.close();
    }

    #[test]
    fn test_purge_resets_watermark() {
        let tmp = TempDir::new().unwrap();
        let disk = open(tmp.path());
        disk.apply(vec![(1, doc("a"))], vec![], 4, true).unwrap();
        disk.commit(4).unwrap();

        disk.purge().unwrap();
        assert_eq!(disk.version(), 0);
        assert_eq!(disk.segment_count(), 0);
        assert_eq!(disk.live_doc_count(), 0);
        disk.close();
    }

    #[test]
    fn test_non_compound_encoding() {
        let tmp = TempDir::new().unwrap();
        {
            let disk = open(tmp.path());
            disk.apply(vec![(7, doc("pair"))], vec![3], 1, false).unwrap();
            disk.commit(1).unwrap();
        }
        assert!(docs_path(tmp.path(), 0).exists());
        assert!(deletes_path(tmp.path(), 0).exists());

        let disk = open(tmp.path());
        assert_eq!(disk.live_doc_count(), 1);
        disk.close();
    }
}
