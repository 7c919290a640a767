//! Leader filters
//!
//! Optional pre-filters applied to candidate leaders before pair emission.
//! A rejected leader suppresses every pair it would head in the current
//! CBC, so counts stay well-defined regardless of how often the leader
//! recurs.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::codec::pack_2bit;
use crate::error::{InputError, Result};

/// Illumina adapter substrings filtered when
/// `--apply_filter_illumina_adapters` is set.
const ILLUMINA_ADAPTERS: &[&str] = &[
    // TruSeq universal adapter
    "AGATCGGAAGAGC",
    // Nextera / TruSight transposase sequence
    "CTGTCTCTTATACACATCT",
    // TruSeq small RNA 3' adapter
    "TGGAATTCTCGGGTGCCAAGG",
    // TruSeq small RNA 5' adapter
    "GTTCAGAGTTCTACAGTCCGACGATC",
];

/// Rejects leaders that contain configured artifact substrings or long
/// single-base runs.
#[derive(Debug, Clone, Default)]
pub struct LeaderFilter {
    leader_len: usize,
    /// 0 disables the poly-ACGT check
    poly_acgt_len: usize,
    /// artifact substrings as (length, packed value)
    artifacts: Vec<(usize, u64)>,
}

impl LeaderFilter {
    pub fn new(leader_len: usize, poly_acgt_len: usize) -> Self {
        Self {
            leader_len,
            poly_acgt_len,
            artifacts: Vec::new(),
        }
    }

    /// Loads artifact substrings from a file, one per line. Artifacts
    /// longer than the leader can never match and are skipped.
    pub fn load_artifacts<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| InputError::CannotOpen(path.to_path_buf()))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let artifact = line.trim();
            if !artifact.is_empty() {
                self.add_artifact(artifact)?;
            }
        }
        Ok(())
    }

    /// Appends the static Illumina adapter list to the artifact set.
    pub fn add_illumina_adapters(&mut self) {
        for adapter in ILLUMINA_ADAPTERS {
            // static sequences are pure ACGT
            self.add_artifact(adapter).unwrap();
        }
    }

    fn add_artifact(&mut self, artifact: &str) -> Result<()> {
        if artifact.len() > self.leader_len || artifact.len() > 32 {
            return Ok(());
        }
        let packed = pack_2bit(artifact.as_bytes())
            .ok_or_else(|| InputError::InvalidAnchorSymbol(artifact.to_string()))?;
        self.artifacts.push((artifact.len(), packed));
        Ok(())
    }

    /// True when no check is configured; lets the hot loop skip the call.
    pub fn is_noop(&self) -> bool {
        self.poly_acgt_len == 0 && self.artifacts.is_empty()
    }

    /// Whether a packed leader should be suppressed.
    pub fn is_rejected(&self, leader: u64) -> bool {
        if self.poly_acgt_len > 0 && has_poly_run(leader, self.leader_len, self.poly_acgt_len) {
            return true;
        }
        self.artifacts
            .iter()
            .any(|&(len, packed)| contains_subkmer(leader, self.leader_len, packed, len))
    }
}

/// Whether a packed k-mer of `len` bases contains a run of `run_len`
/// identical bases.
fn has_poly_run(kmer: u64, len: usize, run_len: usize) -> bool {
    if run_len == 0 || run_len > len {
        return false;
    }
    let mut prev = 4u64;
    let mut run = 0usize;
    for i in (0..len).rev() {
        let base = (kmer >> (2 * i)) & 3;
        if base == prev {
            run += 1;
        } else {
            prev = base;
            run = 1;
        }
        if run >= run_len {
            return true;
        }
    }
    false
}

/// Whether `needle` (of `needle_len` bases) occurs as a substring of the
/// packed k-mer `hay` (of `hay_len` bases).
fn contains_subkmer(hay: u64, hay_len: usize, needle: u64, needle_len: usize) -> bool {
    if needle_len > hay_len {
        return false;
    }
    let mask = if needle_len == 32 {
        u64::MAX
    } else {
        (1u64 << (2 * needle_len)) - 1
    };
    (0..=hay_len - needle_len)
        .any(|shift| (hay >> (2 * shift)) & mask == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(s: &[u8]) -> u64 {
        pack_2bit(s).unwrap()
    }

    #[test]
    fn test_poly_run_detection() {
        assert!(has_poly_run(packed(b"AAAACGTA"), 8, 4));
        assert!(has_poly_run(packed(b"ACGTTTTT"), 8, 5));
        assert!(!has_poly_run(packed(b"ACGTACGT"), 8, 2));
        assert!(has_poly_run(packed(b"ACGGTACT"), 8, 2));
        assert!(!has_poly_run(packed(b"ACGTACGT"), 8, 0));
    }

    #[test]
    fn test_poly_run_counts_leading_a() {
        // leading As sit in the zero high bits of the packed word and
        // must still count as a run
        assert!(has_poly_run(packed(b"AAACGTGT"), 8, 3));
    }

    #[test]
    fn test_contains_subkmer() {
        let hay = packed(b"ACGTACGT");
        assert!(contains_subkmer(hay, 8, packed(b"GTAC"), 4));
        assert!(contains_subkmer(hay, 8, packed(b"ACGT"), 4));
        assert!(contains_subkmer(hay, 8, packed(b"T"), 1));
        assert!(!contains_subkmer(hay, 8, packed(b"GGGG"), 4));
        assert!(!contains_subkmer(hay, 8, packed(b"ACGTACGTA"), 9));
    }

    #[test]
    fn test_filter_noop() {
        let filter = LeaderFilter::new(8, 0);
        assert!(filter.is_noop());
        assert!(!filter.is_rejected(packed(b"AAAAAAAA")));
    }

    #[test]
    fn test_filter_poly() {
        let filter = LeaderFilter::new(8, 4);
        assert!(filter.is_rejected(packed(b"AAAACGTA")));
        assert!(!filter.is_rejected(packed(b"ACGTACGT")));
    }

    #[test]
    fn test_filter_artifact() {
        let mut filter = LeaderFilter::new(8, 0);
        filter.add_artifact("CGTA").unwrap();
        assert!(filter.is_rejected(packed(b"ACGTACGT")));
        assert!(!filter.is_rejected(packed(b"ACCTACCT")));
    }

    #[test]
    fn test_adapters_shorter_leader_never_match() {
        let mut filter = LeaderFilter::new(8, 0);
        filter.add_illumina_adapters();
        // every static adapter is longer than 8 bases
        assert!(filter.is_noop() || !filter.is_rejected(packed(b"AGATCGGA")));
    }

    #[test]
    fn test_adapter_match_with_long_leader() {
        let mut filter = LeaderFilter::new(20, 0);
        filter.add_illumina_adapters();
        // 20-base leader embedding the TruSeq adapter prefix
        let leader = packed(b"AGATCGGAAGAGCAAAACGT");
        assert!(filter.is_rejected(leader));
    }
}
