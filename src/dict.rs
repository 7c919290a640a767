//! Anchor dictionary
//!
//! An immutable set of accepted leader k-mers, built once at startup and
//! shared by reference across all workers. Membership is the hot path of
//! pair enumeration, so the set holds pre-packed `u64` values and lookups
//! never allocate.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use rustc_hash::FxHashSet;

use crate::codec::pack_2bit;
use crate::error::{InputError, Result};

/// Set of accepted leader k-mers, packed with the runtime's direct encoding.
#[derive(Debug, Clone)]
pub struct AnchorDict {
    anchors: FxHashSet<u64>,
    leader_len: usize,
}

impl AnchorDict {
    /// Builds a dictionary from pre-packed k-mer values.
    pub fn from_packed(anchors: impl IntoIterator<Item = u64>, leader_len: usize) -> Self {
        Self {
            anchors: anchors.into_iter().collect(),
            leader_len,
        }
    }

    /// Loads a dictionary from a text file: one k-mer per line, or a TSV
    /// whose header row names an `anchor` column. Duplicates collapse.
    pub fn from_path<P: AsRef<Path>>(path: P, leader_len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| InputError::CannotOpen(path.to_path_buf()))?;
        Self::from_reader(BufReader::new(file), leader_len)
    }

    /// Loads a dictionary from any buffered text source.
    pub fn from_reader<R: Read>(reader: BufReader<R>, leader_len: usize) -> Result<Self> {
        let mut anchors = FxHashSet::default();
        let mut column: Option<usize> = None;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            // a TSV header row selects the anchor column; otherwise the
            // whole line is the k-mer
            if line_no == 0 && line.contains('\t') {
                column = line.split('\t').position(|field| field == "anchor");
                if column.is_some() {
                    continue;
                }
            }

            let field = match column {
                Some(idx) => line
                    .split('\t')
                    .nth(idx)
                    .ok_or_else(|| InputError::WrongAnchorLength(line.to_string()))?,
                None => line,
            };

            if field.len() != leader_len {
                return Err(InputError::WrongAnchorLength(field.to_string()).into());
            }
            let packed = pack_2bit(field.as_bytes())
                .ok_or_else(|| InputError::InvalidAnchorSymbol(field.to_string()))?;
            anchors.insert(packed);
        }

        log::info!("anchor dictionary loaded: {} k-mers", anchors.len());
        Ok(Self {
            anchors,
            leader_len,
        })
    }

    /// Membership test for a packed leader. Safe to call concurrently,
    /// never allocates.
    #[inline]
    pub fn is_accepted(&self, leader: u64) -> bool {
        self.anchors.contains(&leader)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn leader_len(&self) -> usize {
        self.leader_len
    }
}
