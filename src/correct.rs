//! Predefined CBC lists and barcode correction
//!
//! A technology-specific allow-list restricts counting to trusted cell
//! barcodes. With correction enabled, a barcode missing from the list is
//! redirected to its 1-substitution nearest neighbour on the list before
//! the read store freezes; ties break to the lexicographically smallest
//! neighbour, which under MSB-first 2-bit packing is the numerically
//! smallest value.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::codec::pack_2bit;
use crate::config::Technology;
use crate::error::{InputError, Result};
use crate::store::ReadHandle;

/// Immutable set of trusted CBCs.
#[derive(Debug, Clone)]
pub struct CbcAllowList {
    cbcs: FxHashSet<u64>,
    cbc_len: usize,
}

impl CbcAllowList {
    pub fn from_packed(cbcs: impl IntoIterator<Item = u64>, cbc_len: usize) -> Self {
        Self {
            cbcs: cbcs.into_iter().collect(),
            cbc_len,
        }
    }

    pub fn from_path<P: AsRef<Path>>(
        path: P,
        technology: Technology,
        cbc_len: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| InputError::CannotOpen(path.to_path_buf()))?;
        let reader = BufReader::new(file);
        match technology {
            Technology::TenX => Self::from_reader_plain(reader, cbc_len),
            Technology::Visium => Self::from_reader_visium(reader, cbc_len),
        }
    }

    /// One CBC per line.
    pub fn from_reader_plain<R: Read>(reader: BufReader<R>, cbc_len: usize) -> Result<Self> {
        let mut cbcs = FxHashSet::default();
        for line in reader.lines() {
            let line = line?;
            let cbc = line.trim();
            if cbc.is_empty() {
                continue;
            }
            cbcs.insert(parse_cbc(cbc, cbc_len)?);
        }
        log::info!("predefined CBC list loaded: {} barcodes", cbcs.len());
        Ok(Self { cbcs, cbc_len })
    }

    /// Visium spot list: `<CBC>-<spot>,<in_tissue>,<row>,<col>,<x>,<y>`;
    /// only lines whose in-tissue flag equals 1 contribute.
    pub fn from_reader_visium<R: Read>(reader: BufReader<R>, cbc_len: usize) -> Result<Self> {
        let re = Regex::new(r"^([ACGT]+)-(.+),([0-9]+),[0-9]+,[0-9]+,[0-9]+,[0-9]+$").unwrap();
        let mut cbcs = FxHashSet::default();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let caps = re
                .captures(line)
                .ok_or_else(|| InputError::MalformedVisiumLine(line.to_string()))?;
            if &caps[3] == "1" {
                cbcs.insert(parse_cbc(&caps[1], cbc_len)?);
            }
        }
        log::info!("predefined Visium CBC list loaded: {} barcodes", cbcs.len());
        Ok(Self { cbcs, cbc_len })
    }

    #[inline]
    pub fn contains(&self, cbc: u64) -> bool {
        self.cbcs.contains(&cbc)
    }

    pub fn len(&self) -> usize {
        self.cbcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cbcs.is_empty()
    }

    /// Smallest trusted CBC within one substitution of `cbc`, or `None`.
    /// A trusted `cbc` maps to itself.
    pub fn correct(&self, cbc: u64) -> Option<u64> {
        if self.contains(cbc) {
            return Some(cbc);
        }
        let mut best: Option<u64> = None;
        for pos in 0..self.cbc_len {
            let shift = 2 * pos;
            let current = (cbc >> shift) & 3;
            for base in 0..4u64 {
                if base == current {
                    continue;
                }
                let candidate = (cbc & !(3u64 << shift)) | (base << shift);
                if self.contains(candidate) && best.is_none_or(|b| candidate < b) {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

fn parse_cbc(cbc: &str, cbc_len: usize) -> Result<u64> {
    if cbc.len() != cbc_len {
        return Err(InputError::WrongPredefinedCbcLength(cbc.to_string()).into());
    }
    pack_2bit(cbc.as_bytes())
        .ok_or_else(|| InputError::InvalidPredefinedCbcSymbol(cbc.to_string()).into())
}

/// Outcome of rewiring the CBC index against an allow-list.
#[derive(Debug, Default, Clone, Copy)]
pub struct RewireStats {
    pub corrected_cbcs: u64,
    pub dropped_cbcs: u64,
    pub dropped_reads: u64,
}

/// Applies the allow-list to the merged CBC index: trusted CBCs stay,
/// correctable ones merge into their neighbour, the rest are dropped.
/// Runs inside [`crate::store::ReadStoreBuilder::freeze_with`], before the
/// store becomes visible to any worker.
pub fn apply_allow_list(
    index: &mut FxHashMap<u64, Vec<ReadHandle>>,
    allow_list: &CbcAllowList,
    apply_correction: bool,
) -> RewireStats {
    let mut stats = RewireStats::default();

    let mut untrusted: Vec<u64> = index
        .keys()
        .copied()
        .filter(|cbc| !allow_list.contains(*cbc))
        .collect();
    untrusted.sort_unstable();

    for cbc in untrusted {
        let target = if apply_correction {
            allow_list.correct(cbc)
        } else {
            None
        };
        let handles = index.remove(&cbc).unwrap_or_default();
        match target {
            Some(target) => {
                stats.corrected_cbcs += 1;
                index.entry(target).or_default().extend(handles);
            }
            None => {
                stats.dropped_cbcs += 1;
                stats.dropped_reads += handles.len() as u64;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn packed(s: &[u8]) -> u64 {
        pack_2bit(s).unwrap()
    }

    #[test]
    fn test_plain_list() {
        let reader = BufReader::new(Cursor::new("ACGT\nTTTT\n"));
        let list = CbcAllowList::from_reader_plain(reader, 4).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(packed(b"ACGT")));
        assert!(!list.contains(packed(b"AAAA")));
    }

    #[test]
    fn test_plain_list_wrong_length() {
        let reader = BufReader::new(Cursor::new("ACGTA\n"));
        assert!(CbcAllowList::from_reader_plain(reader, 4).is_err());
    }

    #[test]
    fn test_visium_list_keeps_in_tissue_only() {
        let text = "ACGT-1,1,0,1,10,20\nTTTT-1,0,0,2,11,21\nGGGG-1,1,1,3,12,22\n";
        let reader = BufReader::new(Cursor::new(text));
        let list = CbcAllowList::from_reader_visium(reader, 4).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(packed(b"ACGT")));
        assert!(!list.contains(packed(b"TTTT")));
        assert!(list.contains(packed(b"GGGG")));
    }

    #[test]
    fn test_visium_malformed_line() {
        let reader = BufReader::new(Cursor::new("not-a-spot-line\n"));
        assert!(CbcAllowList::from_reader_visium(reader, 4).is_err());
    }

    #[test]
    fn test_correct_identity() {
        let list = CbcAllowList::from_packed([packed(b"ACGT")], 4);
        assert_eq!(list.correct(packed(b"ACGT")), Some(packed(b"ACGT")));
    }

    #[test]
    fn test_correct_single_substitution() {
        let list = CbcAllowList::from_packed([packed(b"ACGT")], 4);
        assert_eq!(list.correct(packed(b"ACGA")), Some(packed(b"ACGT")));
        assert_eq!(list.correct(packed(b"TCGT")), Some(packed(b"ACGT")));
        // two substitutions away
        assert_eq!(list.correct(packed(b"TCGA")), None);
    }

    #[test]
    fn test_correct_tie_breaks_to_smallest() {
        // "AAGT" is one substitution from both neighbours
        let list = CbcAllowList::from_packed([packed(b"ACGT"), packed(b"AAGG")], 4);
        assert_eq!(list.correct(packed(b"AAGT")), Some(packed(b"AAGG")));
    }

    #[test]
    fn test_apply_allow_list_drop_and_merge() {
        let mut index: FxHashMap<u64, Vec<ReadHandle>> = FxHashMap::default();
        let trusted = packed(b"ACGT");
        let near = packed(b"ACGA");
        let far = packed(b"GGGG");

        // seed the index through a real builder so handles are genuine
        let builder = crate::store::ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        for (cbc, n) in [(trusted, 2), (near, 1), (far, 3)] {
            for _ in 0..n {
                builder.register(0, cbc, b"ACGTACGT", &mut scratch).unwrap();
            }
        }
        let store = builder.freeze_with(|idx| {
            index = idx.clone();
        });
        drop(store);

        let list = CbcAllowList::from_packed([trusted], 4);
        let stats = apply_allow_list(&mut index, &list, true);
        assert_eq!(stats.corrected_cbcs, 1);
        assert_eq!(stats.dropped_cbcs, 1);
        assert_eq!(stats.dropped_reads, 3);
        assert_eq!(index.len(), 1);
        assert_eq!(index[&trusted].len(), 3);
    }

    #[test]
    fn test_apply_allow_list_without_correction() {
        let mut index: FxHashMap<u64, Vec<ReadHandle>> = FxHashMap::default();
        let builder = crate::store::ReadStoreBuilder::new(1);
        let mut scratch = Vec::new();
        builder
            .register(0, packed(b"ACGA"), b"ACGTACGT", &mut scratch)
            .unwrap();
        builder.freeze_with(|idx| {
            index = idx.clone();
        });

        let list = CbcAllowList::from_packed([packed(b"ACGT")], 4);
        let stats = apply_allow_list(&mut index, &list, false);
        assert_eq!(stats.corrected_cbcs, 0);
        assert_eq!(stats.dropped_cbcs, 1);
        assert!(index.is_empty());
    }
}
