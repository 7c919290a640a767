//! Sharded output
//!
//! Counts are persisted across `n_splits` independent shard files. Each
//! shard starts with a fixed self-describing [`ShardHeader`] carrying the
//! field widths and k-mer geometry, followed by blocks: a `u32` record
//! count, a `u64` payload length, and the payload itself, which is the
//! shared-prefix delta stream of [`crate::pack`], optionally
//! zstd-compressed. Workers submit packed blocks concurrently; each shard
//! writer serializes submissions behind its own lock, so block boundaries
//! are preserved in the file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::config::{CountingMode, Params};
use crate::error::{OutputError, Result};
use crate::pack::{unpack_records, BkcRecord, RecordWidths};

const SHARD_MAGIC: [u8; 4] = *b"BKCF";
const SHARD_VERSION: u8 = 1;

/// Self-describing header at the start of every shard file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct ShardHeader {
    magic: [u8; 4],
    pub version: u8,
    /// 0 = single k-mers, 1 = k-mer pairs
    pub counting_mode: u8,
    /// 1 when block payloads are zstd-compressed
    pub compressed: u8,
    pub canonical: u8,

    // field byte widths
    pub sample_id_bytes: u8,
    pub barcode_bytes: u8,
    pub leader_bytes: u8,
    pub follower_bytes: u8,
    pub counter_bytes: u8,

    // barcode and k-mer geometry, in bases
    pub cbc_len: u8,
    pub umi_len: u8,
    pub leader_len: u8,
    pub follower_len: u8,
    reserved0: [u8; 3],
    pub gap_len: u32,

    pub max_count: u64,
    reserved: [u8; 8],
}

impl ShardHeader {
    pub fn from_params(params: &Params) -> Self {
        Self {
            magic: SHARD_MAGIC,
            version: SHARD_VERSION,
            counting_mode: match params.mode {
                CountingMode::Single => 0,
                CountingMode::Pair => 1,
            },
            compressed: u8::from(params.zstd_level > 0),
            canonical: u8::from(params.canonical),
            sample_id_bytes: params.sample_id_bytes() as u8,
            barcode_bytes: params.barcode_bytes() as u8,
            leader_bytes: params.leader_bytes() as u8,
            follower_bytes: params.follower_bytes() as u8,
            counter_bytes: params.counter_bytes() as u8,
            cbc_len: params.cbc_len as u8,
            umi_len: params.umi_len as u8,
            leader_len: params.leader_len as u8,
            follower_len: params.follower_len as u8,
            reserved0: [0; 3],
            gap_len: params.gap_len as u32,
            max_count: params.max_count,
            reserved: [0; 8],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Self = bytemuck::pod_read_unaligned(bytes);
        if header.magic != SHARD_MAGIC {
            return Err(OutputError::InvalidMagic.into());
        }
        if header.version != SHARD_VERSION {
            return Err(OutputError::UnsupportedVersion(header.version).into());
        }
        Ok(header)
    }

    /// Field widths recorded in the header.
    pub fn widths(&self) -> RecordWidths {
        RecordWidths {
            sample_id: self.sample_id_bytes as usize,
            barcode: self.barcode_bytes as usize,
            leader: self.leader_bytes as usize,
            follower: self.follower_bytes as usize,
            counter: self.counter_bytes as usize,
        }
    }

    pub const fn size() -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Writer for one shard file. Submissions from different workers are
/// serialized by the internal lock; compression happens outside it.
pub struct ShardWriter {
    inner: Mutex<BufWriter<File>>,
    zstd_level: i32,
    path: PathBuf,
}

impl ShardWriter {
    /// Creates the shard file and writes its header.
    pub fn create(path: PathBuf, header: &ShardHeader, zstd_level: i32) -> Result<Self> {
        let mut handle = BufWriter::new(File::create(&path)?);
        handle.write_all(header.as_bytes())?;
        Ok(Self {
            inner: Mutex::new(handle),
            zstd_level,
            path,
        })
    }

    /// Appends one packed block. Empty blocks are skipped.
    pub fn add_packed(&self, packed: &[u8], n_records: u32) -> Result<()> {
        if packed.is_empty() {
            return Ok(());
        }

        let mut zbuf = Vec::new();
        let payload: &[u8] = if self.zstd_level > 0 {
            zstd::stream::copy_encode(packed, &mut zbuf, self.zstd_level)?;
            &zbuf
        } else {
            packed
        };

        let mut inner = self.inner.lock();
        inner.write_u32::<LittleEndian>(n_records)?;
        inner.write_u64::<LittleEndian>(payload.len() as u64)?;
        inner.write_all(payload)?;
        Ok(())
    }

    pub fn finish(&self) -> Result<()> {
        self.inner.lock().flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The full set of shard writers for a run.
pub struct ShardSet {
    writers: Vec<ShardWriter>,
}

impl ShardSet {
    /// Opens `n_splits` shard files named `<output_name>.<index>`.
    pub fn create(params: &Params) -> Result<Self> {
        let header = ShardHeader::from_params(params);
        let writers = (0..params.n_splits)
            .map(|i| {
                let path = PathBuf::from(format!("{}.{}", params.output_name, i));
                ShardWriter::create(path, &header, params.zstd_level)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { writers })
    }

    pub fn writer(&self, shard: usize) -> &ShardWriter {
        &self.writers[shard]
    }

    pub fn n_shards(&self) -> usize {
        self.writers.len()
    }

    /// Flushes every shard; call after the workers join.
    pub fn finish(&self) -> Result<()> {
        for writer in &self.writers {
            writer.finish()?;
        }
        Ok(())
    }
}

/// Reader for one shard file; iterates blocks and decodes the delta
/// streams back into records.
pub struct ShardReader {
    inner: BufReader<File>,
    header: ShardHeader,
    widths: RecordWidths,
}

impl ShardReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut inner = BufReader::new(File::open(path)?);
        let mut header_bytes = vec![0u8; ShardHeader::size()];
        inner.read_exact(&mut header_bytes)?;
        let header = ShardHeader::from_bytes(&header_bytes)?;
        let widths = header.widths();
        Ok(Self {
            inner,
            header,
            widths,
        })
    }

    pub fn header(&self) -> &ShardHeader {
        &self.header
    }

    /// Decodes the next block into `out`, returning the record count, or
    /// `None` at end of file.
    pub fn read_block(&mut self, out: &mut Vec<BkcRecord>) -> Result<Option<usize>> {
        let n_records = match self.inner.read_u32::<LittleEndian>() {
            Ok(n) => n as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload_len = self.inner.read_u64::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; payload_len];
        self.inner.read_exact(&mut payload)?;

        let before = out.len();
        if self.header.compressed == 1 {
            let mut unpacked = Vec::new();
            zstd::stream::copy_decode(payload.as_slice(), &mut unpacked)?;
            unpack_records(&unpacked, &self.widths, out)?;
        } else {
            unpack_records(&payload, &self.widths, out)?;
        }
        debug_assert_eq!(out.len() - before, n_records);
        Ok(Some(n_records))
    }

    /// Reads every record remaining in the shard.
    pub fn read_all(&mut self) -> Result<Vec<BkcRecord>> {
        let mut records = Vec::new();
        while self.read_block(&mut records)?.is_some() {}
        Ok(records)
    }
}
