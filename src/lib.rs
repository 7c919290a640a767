//! # BKC
//!
//! The `bkc` library counts k-mers and (leader, follower) k-mer pairs in
//! barcoded single-cell sequencing reads.
//!
//! Given paired FASTA/FASTQ files (read 1 carries a cell barcode (CBC)
//! plus a unique molecular identifier, read 2 carries biological sequence),
//! it groups reads by CBC, extracts every pair whose leader appears in a
//! caller-supplied anchor dictionary, counts each
//! `(sample, CBC, leader, follower)` tuple exactly, and emits the result as
//! a sharded, delta-compressed binary table.
//!
//! The pipeline has two strictly separated phases:
//!
//! 1. **Ingestion** ([`ingest`]): paraseq readers fan records out to loader
//!    threads that validate the CBC+UMI read, pack the biological read into
//!    a 3-bit arena ([`store`]), and index it by barcode.
//! 2. **Counting** ([`count`]): once the store is frozen, workers claim
//!    CBCs from an atomic cursor, enumerate pairs with rolling windows
//!    ([`kmer`]), gate leaders through the anchor dictionary ([`dict`]) and
//!    filters ([`filters`]), reduce sorted runs to counts, and route every
//!    record to `murmur64(leader) mod n_splits` shard writers ([`output`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bkc::{Counter, LeaderFilter, Params, ReadStoreBuilder, Result, ShardSet};
//!
//! fn main() -> Result<()> {
//!     let params = Params {
//!         input_pairs: vec![("barcodes.fastq".into(), "reads.fastq".into())],
//!         ..Params::default()
//!     };
//!     params.validate()?;
//!
//!     let store = Arc::new(ReadStoreBuilder::new(params.input_pairs.len()));
//!     bkc::run_ingestion(&params, &store, None)?;
//!     let store = Arc::try_unwrap(store).ok().unwrap().freeze();
//!
//!     let filter = LeaderFilter::new(params.leader_len, params.poly_acgt_len);
//!     let shards = ShardSet::create(&params)?;
//!     Counter::new(&params, &store, None, &filter).run(&shards)?;
//!     shards.finish()?;
//!     Ok(())
//! }
//! ```

/// Base-level 3-bit and 2-bit codecs
pub mod codec;

/// Runtime parameters and validation
pub mod config;

/// CBC allow-lists and 1-substitution correction
pub mod correct;

/// Per-CBC counting worker pool
pub mod count;

/// Anchor dictionary
pub mod dict;

/// Error definitions
pub mod error;

/// Leader filters (poly-ACGT, artifacts, Illumina adapters)
pub mod filters;

/// Shard-routing hash
pub mod hash;

/// Paired FASTX ingestion pipeline
pub mod ingest;

/// Rolling k-mer windows
pub mod kmer;

/// Shard file headers, writers and readers
pub mod output;

/// Record field packing and shared-prefix delta coding
pub mod pack;

/// Shared read store
pub mod store;

pub use config::{
    CountingMode, ExportFilteredInput, InputFormat, OutputFormat, Params, Technology,
};
pub use correct::{apply_allow_list, CbcAllowList, RewireStats};
pub use count::{CountStats, Counter};
pub use dict::AnchorDict;
pub use error::{Error, Result};
pub use filters::LeaderFilter;
pub use ingest::{run_ingestion, IngestStats};
pub use output::{ShardHeader, ShardReader, ShardSet, ShardWriter};
pub use pack::{BkcRecord, RecordWidths};
pub use store::{ReadHandle, ReadStore, ReadStoreBuilder};
