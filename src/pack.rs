//! Record packing
//!
//! Output records are serialized as fixed-width big-endian integers and
//! then delta-packed: each record stores one byte giving the length of the
//! byte-wise prefix it shares with its predecessor, followed by the
//! remaining suffix. Workers sort records per CBC before packing, so
//! neighbouring records share long prefixes and blocks stay small even
//! before zstd sees them.

use crate::config::Params;
use crate::error::{OutputError, Result};

/// One output tuple prior to packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BkcRecord {
    pub sample_id: u64,
    pub cbc: u64,
    pub leader: u64,
    pub follower: u64,
    pub count: u64,
}

/// Byte widths of the five record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordWidths {
    pub sample_id: usize,
    pub barcode: usize,
    pub leader: usize,
    pub follower: usize,
    pub counter: usize,
}

impl RecordWidths {
    pub fn from_params(params: &Params) -> Self {
        Self {
            sample_id: params.sample_id_bytes(),
            barcode: params.barcode_bytes(),
            leader: params.leader_bytes(),
            follower: params.follower_bytes(),
            counter: params.counter_bytes(),
        }
    }

    pub fn record_size(&self) -> usize {
        self.sample_id + self.barcode + self.leader + self.follower + self.counter
    }

    /// Appends the field bytes of one record to `out`.
    pub fn encode_record(&self, record: &BkcRecord, out: &mut Vec<u8>) {
        append_int_msb(out, record.sample_id, self.sample_id);
        append_int_msb(out, record.cbc, self.barcode);
        append_int_msb(out, record.leader, self.leader);
        append_int_msb(out, record.follower, self.follower);
        append_int_msb(out, record.count, self.counter);
    }

    /// Reads one record back from exactly `record_size()` bytes.
    pub fn decode_record(&self, bytes: &[u8]) -> BkcRecord {
        debug_assert_eq!(bytes.len(), self.record_size());
        let mut pos = 0;
        let mut take = |width: usize| {
            let value = read_int_msb(&bytes[pos..pos + width]);
            pos += width;
            value
        };
        BkcRecord {
            sample_id: take(self.sample_id),
            cbc: take(self.barcode),
            leader: take(self.leader),
            follower: take(self.follower),
            count: take(self.counter),
        }
    }
}

/// Appends `value` most-significant-byte first, zero-padded to `n_bytes`.
/// A zero width writes nothing (the follower field in single mode).
pub fn append_int_msb(out: &mut Vec<u8>, value: u64, n_bytes: usize) {
    for i in (0..n_bytes).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}

/// Inverse of [`append_int_msb`] over a width-sized slice.
pub fn read_int_msb(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Delta-packs `records` into `out` (cleared first).
pub fn pack_records(records: &[BkcRecord], widths: &RecordWidths, out: &mut Vec<u8>) {
    out.clear();
    let mut prev: Vec<u8> = Vec::with_capacity(widths.record_size());
    let mut curr: Vec<u8> = Vec::with_capacity(widths.record_size());

    for record in records {
        curr.clear();
        widths.encode_record(record, &mut curr);

        let shared = prev
            .iter()
            .zip(curr.iter())
            .take_while(|(a, b)| a == b)
            .count();
        out.push(shared as u8);
        out.extend_from_slice(&curr[shared..]);

        std::mem::swap(&mut prev, &mut curr);
    }
}

/// Decodes a delta-packed payload back into records, appending to `out`.
pub fn unpack_records(
    packed: &[u8],
    widths: &RecordWidths,
    out: &mut Vec<BkcRecord>,
) -> Result<()> {
    let record_size = widths.record_size();
    let mut prev = vec![0u8; record_size];
    let mut pos = 0;

    while pos < packed.len() {
        let shared = packed[pos] as usize;
        pos += 1;
        if shared > record_size {
            return Err(OutputError::CorruptDeltaStream {
                prefix: shared,
                record_size,
            }
            .into());
        }
        let suffix_len = record_size - shared;
        if pos + suffix_len > packed.len() {
            return Err(OutputError::TruncatedBlock(pos).into());
        }
        prev[shared..].copy_from_slice(&packed[pos..pos + suffix_len]);
        pos += suffix_len;
        out.push(widths.decode_record(&prev));
    }
    Ok(())
}
