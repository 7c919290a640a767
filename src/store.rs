//! Shared read store
//!
//! All biological reads live here, 3-bit packed inside per-file arenas, and
//! are indexed by cell barcode. The store has two phases with two types:
//! a [`ReadStoreBuilder`] that accepts concurrent registrations from loader
//! threads, and the frozen [`ReadStore`] handed to the counting workers,
//! which is read-only and therefore lock-free.
//!
//! Arenas grow in fixed-size segments that are never reallocated, so a read
//! handle can address its bytes directly: file index in bits 63..48,
//! segment in bits 47..32, byte offset in bits 31..0.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::codec;
use crate::error::{Result, StoreError};

/// Fixed arena segment size. Large enough that the longest storable read
/// (64 KiB of bases, 24 KiB packed) fits many times over.
const SEGMENT_SIZE: usize = 1 << 22;

/// Number of locks striping the CBC index during ingestion.
const INDEX_SHARDS: usize = 64;

/// Opaque 64-bit identifier of a stored read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadHandle(u64);

impl ReadHandle {
    fn new(file_index: usize, segment: usize, offset: usize) -> Self {
        debug_assert!(file_index < (1 << 16));
        debug_assert!(segment < (1 << 16));
        debug_assert!(offset < (1 << 32));
        Self((file_index as u64) << 48 | (segment as u64) << 32 | offset as u64)
    }

    pub fn file_index(self) -> usize {
        (self.0 >> 48) as usize
    }

    fn segment(self) -> usize {
        ((self.0 >> 32) & 0xFFFF) as usize
    }

    fn offset(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }
}

/// Append-only packed-read storage for one input file pair.
#[derive(Debug, Default)]
struct FileArena {
    segments: Vec<Vec<u8>>,
}

impl FileArena {
    /// Appends one encoded read, returning its (segment, offset) address.
    /// Records never straddle a segment boundary.
    fn append(&mut self, encoded: &[u8]) -> (usize, usize) {
        let needs_new = match self.segments.last() {
            Some(seg) => seg.len() + encoded.len() > SEGMENT_SIZE,
            None => true,
        };
        if needs_new {
            self.segments.push(Vec::with_capacity(SEGMENT_SIZE));
        }
        let segment = self.segments.len() - 1;
        let seg = self.segments.last_mut().unwrap();
        let offset = seg.len();
        seg.extend_from_slice(encoded);
        (segment, offset)
    }

    fn get(&self, segment: usize, offset: usize) -> Result<&[u8]> {
        let seg = self
            .segments
            .get(segment)
            .filter(|seg| offset < seg.len())
            .ok_or(StoreError::HandleOutOfBounds { segment, offset })?;
        Ok(&seg[offset..])
    }
}

/// Write phase of the read store; shared by reference across loader threads.
pub struct ReadStoreBuilder {
    arenas: Vec<Mutex<FileArena>>,
    index: Vec<Mutex<FxHashMap<u64, Vec<ReadHandle>>>>,
    n_reads: AtomicU64,
    n_bases: AtomicU64,
}

impl ReadStoreBuilder {
    pub fn new(n_files: usize) -> Self {
        Self {
            arenas: (0..n_files).map(|_| Mutex::new(FileArena::default())).collect(),
            index: (0..INDEX_SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect(),
            n_reads: AtomicU64::new(0),
            n_bases: AtomicU64::new(0),
        }
    }

    /// Packs `bases` through `scratch` and registers the read under `cbc`.
    ///
    /// Callable from any number of loader threads; the file arena and the
    /// CBC's index stripe are each locked briefly.
    pub fn register(
        &self,
        file_index: usize,
        cbc: u64,
        bases: &[u8],
        scratch: &mut Vec<u8>,
    ) -> Result<ReadHandle> {
        scratch.clear();
        codec::encode_bases(bases, scratch)?;

        let (segment, offset) = {
            let mut arena = self
                .arenas
                .get(file_index)
                .ok_or(StoreError::UnknownFile(file_index))?
                .lock();
            arena.append(scratch)
        };
        let handle = ReadHandle::new(file_index, segment, offset);

        let stripe = (cbc as usize) % INDEX_SHARDS;
        self.index[stripe].lock().entry(cbc).or_default().push(handle);

        self.n_reads.fetch_add(1, Ordering::Relaxed);
        self.n_bases.fetch_add(bases.len() as u64, Ordering::Relaxed);
        Ok(handle)
    }

    pub fn n_reads(&self) -> u64 {
        self.n_reads.load(Ordering::Relaxed)
    }

    pub fn n_bases(&self) -> u64 {
        self.n_bases.load(Ordering::Relaxed)
    }

    /// Freezes the store. `rewire` runs on the merged CBC index before the
    /// snapshot is taken; CBC correction and allow-list filtering hook in
    /// here so the frozen store is immutable from the first moment.
    pub fn freeze_with<F>(self, rewire: F) -> ReadStore
    where
        F: FnOnce(&mut FxHashMap<u64, Vec<ReadHandle>>),
    {
        let arenas: Vec<FileArena> =
            self.arenas.into_iter().map(Mutex::into_inner).collect();

        let mut index: FxHashMap<u64, Vec<ReadHandle>> = FxHashMap::default();
        for stripe in self.index {
            for (cbc, handles) in stripe.into_inner() {
                index.entry(cbc).or_default().extend(handles);
            }
        }

        rewire(&mut index);
        index.retain(|_, handles| !handles.is_empty());

        let mut cbcs: Vec<u64> = index.keys().copied().collect();
        cbcs.sort_unstable();

        ReadStore {
            arenas,
            index,
            cbcs,
            n_reads: self.n_reads.into_inner(),
            n_bases: self.n_bases.into_inner(),
        }
    }

    pub fn freeze(self) -> ReadStore {
        self.freeze_with(|_| {})
    }
}

/// Frozen read store; read-only, shared by reference across workers.
pub struct ReadStore {
    arenas: Vec<FileArena>,
    index: FxHashMap<u64, Vec<ReadHandle>>,
    cbcs: Vec<u64>,
    n_reads: u64,
    n_bases: u64,
}

impl ReadStore {
    /// Snapshot of all indexed CBCs, in ascending packed order.
    pub fn cbcs(&self) -> &[u64] {
        &self.cbcs
    }

    /// Read handles registered under a CBC, in registration order.
    pub fn reads_of(&self, cbc: u64) -> &[ReadHandle] {
        self.index.get(&cbc).map_or(&[], Vec::as_slice)
    }

    /// Decodes the bases of a stored read into `out` (cleared first).
    pub fn decode(&self, handle: ReadHandle, out: &mut Vec<u8>) -> Result<()> {
        let arena = self
            .arenas
            .get(handle.file_index())
            .ok_or(StoreError::UnknownFile(handle.file_index()))?;
        let bytes = arena.get(handle.segment(), handle.offset())?;
        codec::decode_bases(bytes, out);
        Ok(())
    }

    pub fn n_cbcs(&self) -> usize {
        self.cbcs.len()
    }

    pub fn n_reads(&self) -> u64 {
        self.n_reads
    }

    pub fn n_bases(&self) -> u64 {
        self.n_bases
    }

    /// Reads indexed under a CBC, summed over `cbcs()`; differs from
    /// `n_reads` when rewiring dropped barcodes.
    pub fn n_indexed_reads(&self) -> u64 {
        self.index.values().map(|v| v.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack_2bit;

    #[test]
    fn test_register_and_decode() {
        let builder = ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        let cbc = pack_2bit(b"AAAA").unwrap();
        let handle = builder.register(0, cbc, b"ACGTNACGT", &mut scratch).unwrap();

        let store = builder.freeze();
        let mut out = Vec::new();
        store.decode(handle, &mut out).unwrap();
        assert_eq!(out, b"ACGTNACGT");
    }

    #[test]
    fn test_index_preserves_registration_order() {
        let builder = ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        let cbc = pack_2bit(b"ACGT").unwrap();
        let h1 = builder.register(0, cbc, b"AAAA", &mut scratch).unwrap();
        let h2 = builder.register(0, cbc, b"CCCC", &mut scratch).unwrap();

        let store = builder.freeze();
        assert_eq!(store.reads_of(cbc), &[h1, h2]);
        assert_eq!(store.n_cbcs(), 1);
        assert_eq!(store.n_reads(), 2);
        assert_eq!(store.n_bases(), 8);
    }

    #[test]
    fn test_multiple_files() {
        let builder = ReadStoreBuilder::new(2);
        let mut scratch = Vec::new();
        let cbc = pack_2bit(b"ACGT").unwrap();
        let h1 = builder.register(0, cbc, b"ACGT", &mut scratch).unwrap();
        let h2 = builder.register(1, cbc, b"TGCA", &mut scratch).unwrap();
        assert_eq!(h1.file_index(), 0);
        assert_eq!(h2.file_index(), 1);

        let store = builder.freeze();
        let mut out = Vec::new();
        store.decode(h2, &mut out).unwrap();
        assert_eq!(out, b"TGCA");
    }

    #[test]
    fn test_unknown_file_rejected() {
        let builder = ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        assert!(builder.register(3, 0, b"ACGT", &mut scratch).is_err());
    }

    #[test]
    fn test_segment_rollover() {
        let builder = ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        let bases = vec![b'G'; 60_000];
        // 60k bases pack into ~22.5 KiB; a few hundred reads force several
        // segments
        let mut handles = Vec::new();
        for i in 0..400 {
            handles.push(builder.register(0, i % 7, &bases, &mut scratch).unwrap());
        }
        assert!(handles.iter().any(|h| h.segment() > 0));

        let store = builder.freeze();
        let mut out = Vec::new();
        for handle in handles {
            store.decode(handle, &mut out).unwrap();
            assert_eq!(out.len(), 60_000);
        }
    }

    #[test]
    fn test_freeze_with_rewires_index() {
        let builder = ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        let keep = pack_2bit(b"AAAA").unwrap();
        let toss = pack_2bit(b"TTTT").unwrap();
        builder.register(0, keep, b"ACGT", &mut scratch).unwrap();
        builder.register(0, toss, b"ACGT", &mut scratch).unwrap();

        let store = builder.freeze_with(|index| {
            index.remove(&toss);
        });
        assert_eq!(store.cbcs(), &[keep]);
        assert_eq!(store.n_indexed_reads(), 1);
    }

    #[test]
    fn test_cbcs_sorted() {
        let builder = ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        for cbc in [9u64, 3, 7, 1] {
            builder.register(0, cbc, b"ACGT", &mut scratch).unwrap();
        }
        let store = builder.freeze();
        assert_eq!(store.cbcs(), &[1, 3, 7, 9]);
    }
}
