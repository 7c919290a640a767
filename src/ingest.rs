//! Ingestion pipeline
//!
//! Drives paired FASTX readers over every `<cbc_umi_file>,<reads_file>`
//! input pair and registers the biological reads into the shared store.
//! Parsing fans out through `paraseq`: its reader thread fills record-set
//! queues with back-pressure while loader threads validate the CBC+UMI
//! read, pack the biological read and register it. Loader-local rejection
//! counters merge into the shared statistics at batch boundaries.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use paraseq::{
    fastx,
    prelude::{IntoProcessError, PairedParallelProcessor, ParallelReader},
    Record,
};
use parking_lot::Mutex;

use crate::codec::pack_2bit;
use crate::config::Params;
use crate::correct::CbcAllowList;
use crate::error::{Error, InputError, Result};
use crate::store::ReadStoreBuilder;

/// Placeholder quality for FASTA input when exporting FASTQ diagnostics.
const DEFAULT_QUALITY_SCORE: u8 = b'?';

/// Non-fatal rejection counters, aggregated across all loader threads.
#[derive(Debug, Default)]
pub struct IngestStats {
    /// CBC+UMI reads outside the acceptable length window
    pub strange_cbc_umi_reads: AtomicU64,
    /// CBCs containing a non-ACGT base, which cannot be 2-bit packed
    pub invalid_cbc_reads: AtomicU64,
    /// biological reads longer than the codec's length prefix allows
    pub oversized_reads: AtomicU64,
    /// reads whose CBC is missing from the allow-list (no correction)
    pub untrusted_cbc_reads: AtomicU64,
}

impl IngestStats {
    pub fn total_dropped(&self) -> u64 {
        self.strange_cbc_umi_reads.load(Ordering::Relaxed)
            + self.invalid_cbc_reads.load(Ordering::Relaxed)
            + self.oversized_reads.load(Ordering::Relaxed)
            + self.untrusted_cbc_reads.load(Ordering::Relaxed)
    }
}

/// Shared writers for the filtered-input diagnostic export.
struct FilteredExport {
    first: Option<Mutex<BufWriter<File>>>,
    second: Option<Mutex<BufWriter<File>>>,
}

impl FilteredExport {
    fn create(params: &Params) -> Result<Option<Arc<Self>>> {
        let mode = params.export_filtered_input;
        if !mode.wants_first() && !mode.wants_second() {
            return Ok(None);
        }
        // validated upstream
        let base = params.filtered_input_path.as_ref().unwrap();
        let open = |suffix: &str| -> Result<Mutex<BufWriter<File>>> {
            let path = base.join(format!("filtered_{suffix}.fastq"));
            Ok(Mutex::new(BufWriter::new(File::create(path)?)))
        };
        Ok(Some(Arc::new(Self {
            first: mode.wants_first().then(|| open("cbc_umi")).transpose()?,
            second: mode.wants_second().then(|| open("reads")).transpose()?,
        })))
    }

    fn flush(&self) -> Result<()> {
        if let Some(writer) = &self.first {
            writer.lock().flush()?;
        }
        if let Some(writer) = &self.second {
            writer.lock().flush()?;
        }
        Ok(())
    }
}

fn write_fastq<W: Write>(writer: &mut W, id: &[u8], seq: &[u8], qual: Option<&[u8]>) -> Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(id)?;
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n+\n")?;
    match qual {
        Some(qual) => writer.write_all(qual)?,
        None => writer.write_all(&vec![DEFAULT_QUALITY_SCORE; seq.len()])?,
    }
    writer.write_all(b"\n")?;
    Ok(())
}

/// Per-thread loader: validates, packs and registers record pairs.
#[derive(Clone)]
struct Loader {
    file_index: usize,
    cbc_len: usize,
    min_len: usize,
    max_len: usize,
    allow_strange: bool,

    /// drops untrusted CBCs at registration time (allow-list present,
    /// correction disabled)
    gate: Option<Arc<CbcAllowList>>,
    /// gates the diagnostic export on raw allow-list membership
    export_list: Option<Arc<CbcAllowList>>,

    store: Arc<ReadStoreBuilder>,
    stats: Arc<IngestStats>,
    export: Option<Arc<FilteredExport>>,

    // thread-local state
    scratch: Vec<u8>,
    local_strange: u64,
    local_invalid_cbc: u64,
    local_oversized: u64,
    local_untrusted: u64,
    export_first_buf: Vec<u8>,
    export_second_buf: Vec<u8>,
}

impl Loader {
    fn flush_local_stats(&mut self) {
        let stats = &self.stats;
        stats
            .strange_cbc_umi_reads
            .fetch_add(self.local_strange, Ordering::Relaxed);
        stats
            .invalid_cbc_reads
            .fetch_add(self.local_invalid_cbc, Ordering::Relaxed);
        stats
            .oversized_reads
            .fetch_add(self.local_oversized, Ordering::Relaxed);
        stats
            .untrusted_cbc_reads
            .fetch_add(self.local_untrusted, Ordering::Relaxed);
        self.local_strange = 0;
        self.local_invalid_cbc = 0;
        self.local_oversized = 0;
        self.local_untrusted = 0;
    }
}

impl<Rf: Record> PairedParallelProcessor<Rf> for Loader {
    fn process_record_pair(&mut self, record1: Rf, record2: Rf) -> paraseq::Result<()> {
        let cbc_umi = record1.seq();

        if cbc_umi.len() < self.min_len || cbc_umi.len() > self.max_len {
            if self.allow_strange {
                self.local_strange += 1;
                return Ok(());
            }
            return Err(Error::from(InputError::StrangeCbcUmiLength {
                len: cbc_umi.len(),
                min: self.min_len,
                max: self.max_len,
            })
            .into_process_error());
        }

        let Some(cbc) = pack_2bit(&cbc_umi[..self.cbc_len]) else {
            self.local_invalid_cbc += 1;
            return Ok(());
        };

        if let Some(gate) = &self.gate {
            if !gate.contains(cbc) {
                self.local_untrusted += 1;
                return Ok(());
            }
        }

        let bases = record2.seq();
        if bases.len() > u16::MAX as usize {
            self.local_oversized += 1;
            return Ok(());
        }

        self.store
            .register(self.file_index, cbc, &bases, &mut self.scratch)
            .map_err(IntoProcessError::into_process_error)?;

        if let Some(export) = &self.export {
            let trusted = self
                .export_list
                .as_ref()
                .map_or(true, |list| list.contains(cbc));
            if trusted {
                if export.first.is_some() {
                    write_fastq(
                        &mut self.export_first_buf,
                        record1.id(),
                        &cbc_umi,
                        record1.qual(),
                    )
                    .map_err(IntoProcessError::into_process_error)?;
                }
                if export.second.is_some() {
                    write_fastq(
                        &mut self.export_second_buf,
                        record2.id(),
                        &bases,
                        record2.qual(),
                    )
                    .map_err(IntoProcessError::into_process_error)?;
                }
            }
        }

        Ok(())
    }

    fn on_batch_complete(&mut self) -> paraseq::Result<()> {
        self.flush_local_stats();
        if let Some(export) = &self.export {
            if let Some(writer) = &export.first {
                writer
                    .lock()
                    .write_all(&self.export_first_buf)
                    .map_err(IntoProcessError::into_process_error)?;
                self.export_first_buf.clear();
            }
            if let Some(writer) = &export.second {
                writer
                    .lock()
                    .write_all(&self.export_second_buf)
                    .map_err(IntoProcessError::into_process_error)?;
                self.export_second_buf.clear();
            }
        }
        Ok(())
    }
}

/// Runs the full ingestion phase over every configured input pair.
///
/// Returns once all readers have drained and all loaders have flushed;
/// after that the caller freezes the store and starts the counting phase.
pub fn run_ingestion(
    params: &Params,
    store: &Arc<ReadStoreBuilder>,
    allow_list: Option<&Arc<CbcAllowList>>,
) -> Result<Arc<IngestStats>> {
    let stats = Arc::new(IngestStats::default());
    let export = FilteredExport::create(params)?;
    let n_threads = params.worker_threads();

    // with correction enabled every CBC is registered and rewired at
    // freeze time; without it, untrusted CBCs are dropped right here
    let gate = if params.apply_cbc_correction {
        None
    } else {
        allow_list.cloned()
    };

    for (file_index, (cbc_umi_path, reads_path)) in params.input_pairs.iter().enumerate() {
        log::info!(
            "loading reads: {} / {}",
            cbc_umi_path.display(),
            reads_path.display()
        );
        let r1 = open_fastx(cbc_umi_path)?;
        let r2 = open_fastx(reads_path)?;

        let mut loader = Loader {
            file_index,
            cbc_len: params.cbc_len,
            min_len: params.cbc_umi_min_len(),
            max_len: params.cbc_umi_max_len(),
            allow_strange: params.allow_strange_cbc_umi_reads,
            gate: gate.clone(),
            export_list: allow_list.cloned(),
            store: Arc::clone(store),
            stats: Arc::clone(&stats),
            export: export.clone(),
            scratch: Vec::new(),
            local_strange: 0,
            local_invalid_cbc: 0,
            local_oversized: 0,
            local_untrusted: 0,
            export_first_buf: Vec::new(),
            export_second_buf: Vec::new(),
        };

        r1.process_parallel_paired(r2, &mut loader, n_threads)
            .map_err(|e| Error::FastxError(e.to_string()))?;
    }

    if let Some(export) = &export {
        export.flush()?;
    }

    log::info!(
        "reads loaded: {} reads, {} bases, {} dropped",
        store.n_reads(),
        store.n_bases(),
        stats.total_dropped()
    );
    Ok(stats)
}

fn open_fastx(path: &Path) -> Result<fastx::Reader<Box<dyn std::io::Read + Send>>> {
    fastx::Reader::from_path(path).map_err(|e| Error::FastxError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fastq_file(path: &Path, records: &[(&str, &str)]) {
        let mut file = File::create(path).unwrap();
        for (id, seq) in records {
            writeln!(file, "@{}\n{}\n+\n{}", id, seq, "I".repeat(seq.len())).unwrap();
        }
    }

    fn base_params(dir: &Path) -> Params {
        Params {
            cbc_len: 4,
            umi_len: 2,
            input_pairs: vec![(dir.join("r1.fq"), dir.join("r2.fq"))],
            output_name: dir.join("out").to_string_lossy().into_owned(),
            ..Params::default()
        }
    }

    #[test]
    fn test_ingest_registers_by_cbc() {
        let dir = tempfile::tempdir().unwrap();
        write_fastq_file(
            &dir.path().join("r1.fq"),
            &[("p1", "AAAACC"), ("p2", "AAAAGG"), ("p3", "TTTTCC")],
        );
        write_fastq_file(
            &dir.path().join("r2.fq"),
            &[("p1", "ACGTACGTACGT"), ("p2", "ACGTACGTACGT"), ("p3", "GGGGTTTTCCCC")],
        );
        let params = base_params(dir.path());

        let store = Arc::new(ReadStoreBuilder::new(1));
        let stats = run_ingestion(&params, &store, None).unwrap();
        assert_eq!(stats.total_dropped(), 0);

        let store = Arc::try_unwrap(store).ok().unwrap().freeze();
        assert_eq!(store.n_reads(), 3);
        assert_eq!(store.n_cbcs(), 2);
        let aaaa = pack_2bit(b"AAAA").unwrap();
        assert_eq!(store.reads_of(aaaa).len(), 2);
    }

    #[test]
    fn test_strange_length_aborts_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_fastq_file(&dir.path().join("r1.fq"), &[("p1", "AAAA")]);
        write_fastq_file(&dir.path().join("r2.fq"), &[("p1", "ACGTACGT")]);
        let params = base_params(dir.path());

        let store = Arc::new(ReadStoreBuilder::new(1));
        assert!(run_ingestion(&params, &store, None).is_err());
    }

    #[test]
    fn test_strange_length_dropped_with_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_fastq_file(&dir.path().join("r1.fq"), &[("p1", "AAAA"), ("p2", "AAAACC")]);
        write_fastq_file(&dir.path().join("r2.fq"), &[("p1", "ACGTACGT"), ("p2", "ACGTACGT")]);
        let params = Params {
            allow_strange_cbc_umi_reads: true,
            ..base_params(dir.path())
        };

        let store = Arc::new(ReadStoreBuilder::new(1));
        let stats = run_ingestion(&params, &store, None).unwrap();
        assert_eq!(stats.strange_cbc_umi_reads.load(Ordering::Relaxed), 1);
        assert_eq!(store.n_reads(), 1);
    }

    #[test]
    fn test_invalid_cbc_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_fastq_file(&dir.path().join("r1.fq"), &[("p1", "ANAACC")]);
        write_fastq_file(&dir.path().join("r2.fq"), &[("p1", "ACGTACGT")]);
        let params = base_params(dir.path());

        let store = Arc::new(ReadStoreBuilder::new(1));
        let stats = run_ingestion(&params, &store, None).unwrap();
        assert_eq!(stats.invalid_cbc_reads.load(Ordering::Relaxed), 1);
        assert_eq!(store.n_reads(), 0);
    }

    #[test]
    fn test_allow_list_gates_registration() {
        let dir = tempfile::tempdir().unwrap();
        write_fastq_file(&dir.path().join("r1.fq"), &[("p1", "AAAACC"), ("p2", "TTTTCC")]);
        write_fastq_file(&dir.path().join("r2.fq"), &[("p1", "ACGTACGT"), ("p2", "ACGTACGT")]);
        let params = base_params(dir.path());

        let allow_list = Arc::new(CbcAllowList::from_packed(
            [pack_2bit(b"AAAA").unwrap()],
            4,
        ));
        let store = Arc::new(ReadStoreBuilder::new(1));
        let stats = run_ingestion(&params, &store, Some(&allow_list)).unwrap();
        assert_eq!(stats.untrusted_cbc_reads.load(Ordering::Relaxed), 1);
        assert_eq!(store.n_reads(), 1);
    }

    #[test]
    fn test_filtered_export_writes_fastq() {
        let dir = tempfile::tempdir().unwrap();
        write_fastq_file(&dir.path().join("r1.fq"), &[("p1", "AAAACC")]);
        write_fastq_file(&dir.path().join("r2.fq"), &[("p1", "ACGTACGT")]);
        let params = Params {
            filtered_input_path: Some(dir.path().to_path_buf()),
            export_filtered_input: crate::config::ExportFilteredInput::Both,
            ..base_params(dir.path())
        };

        let store = Arc::new(ReadStoreBuilder::new(1));
        run_ingestion(&params, &store, None).unwrap();

        let first = std::fs::read_to_string(dir.path().join("filtered_cbc_umi.fastq")).unwrap();
        let second = std::fs::read_to_string(dir.path().join("filtered_reads.fastq")).unwrap();
        assert!(first.contains("AAAACC"));
        assert!(second.contains("ACGTACGT"));
    }
}
