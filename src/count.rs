//! Per-CBC counting
//!
//! The counting phase walks the frozen read store one cell barcode at a
//! time. Workers claim CBCs through a shared atomic cursor, enumerate
//! k-mers or (leader, follower) pairs with rolling windows, sort and
//! run-length-reduce them, and route every count to its shard buffer.
//! Anchor gating and leader filters run before a pair is emitted, so a
//! rejected leader contributes nothing to any count.
//!
//! Workers never share scratch state; the only mutable state they touch
//! is the claim cursor, the statistics counters, and the short critical
//! section inside each shard writer.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::codec::dna_code;
use crate::config::{CountingMode, Params};
use crate::dict::AnchorDict;
use crate::error::Result;
use crate::filters::LeaderFilter;
use crate::hash::shard_of;
use crate::kmer::{KmerMode, KmerWindow};
use crate::output::ShardSet;
use crate::pack::{pack_records, BkcRecord, RecordWidths};
use crate::store::ReadStore;

/// Counters reported at the end of the counting phase.
#[derive(Debug, Default)]
pub struct CountStats {
    /// distinct (leader, follower) counts emitted across all shards
    pub emitted_counts: AtomicU64,
    /// sum of the emitted count values
    pub summed_counts: AtomicU64,
    /// candidate leaders rejected by the anchor dictionary
    pub leaders_not_accepted: AtomicU64,
    /// candidate leaders rejected by the configured filters
    pub leaders_filtered: AtomicU64,
}

/// One counting run over a frozen store.
pub struct Counter<'a> {
    params: &'a Params,
    store: &'a ReadStore,
    dict: Option<&'a AnchorDict>,
    filter: &'a LeaderFilter,
}

/// Thread-local scratch, reused across CBCs.
struct Workspace {
    read_buf: Vec<u8>,
    pairs: Vec<(u64, u64)>,
    counts: Vec<(u64, u64, u64)>,
    record_buffers: Vec<Vec<BkcRecord>>,
    packed: Vec<u8>,
    local_not_accepted: u64,
    local_filtered: u64,
}

impl Workspace {
    fn new(n_splits: usize) -> Self {
        Self {
            read_buf: Vec::new(),
            pairs: Vec::new(),
            counts: Vec::new(),
            record_buffers: vec![Vec::new(); n_splits],
            packed: Vec::new(),
            local_not_accepted: 0,
            local_filtered: 0,
        }
    }
}

impl<'a> Counter<'a> {
    pub fn new(
        params: &'a Params,
        store: &'a ReadStore,
        dict: Option<&'a AnchorDict>,
        filter: &'a LeaderFilter,
    ) -> Self {
        Self {
            params,
            store,
            dict,
            filter,
        }
    }

    /// Runs the worker pool to exhaustion and flushes every shard buffer.
    pub fn run(&self, shards: &ShardSet) -> Result<CountStats> {
        let n_threads = self.params.worker_threads();
        let widths = RecordWidths::from_params(self.params);
        let cbcs = self.store.cbcs();
        let stats = CountStats::default();
        let claim = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);

        log::info!(
            "counting over {} CBCs with {} threads",
            cbcs.len(),
            n_threads
        );

        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(n_threads);
            for _ in 0..n_threads {
                handles.push(scope.spawn(|| -> Result<()> {
                    let mut ws = Workspace::new(shards.n_shards());
                    loop {
                        let idx = claim.fetch_add(1, Ordering::Relaxed);
                        if idx >= cbcs.len() || abort.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = self.process_cbc(cbcs[idx], &mut ws, shards, &widths, &stats)
                        {
                            abort.store(true, Ordering::Relaxed);
                            return Err(e);
                        }
                    }
                    self.final_flush(&mut ws, shards, &widths)?;
                    stats
                        .leaders_not_accepted
                        .fetch_add(ws.local_not_accepted, Ordering::Relaxed);
                    stats
                        .leaders_filtered
                        .fetch_add(ws.local_filtered, Ordering::Relaxed);
                    Ok(())
                }));
            }

            let mut first_err = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => first_err = first_err.or(Some(e)),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            first_err.map_or(Ok(()), Err)
        })?;

        log::debug!(
            "total counts emitted: {}, summed: {}",
            stats.emitted_counts.load(Ordering::Relaxed),
            stats.summed_counts.load(Ordering::Relaxed)
        );
        Ok(stats)
    }

    fn process_cbc(
        &self,
        cbc: u64,
        ws: &mut Workspace,
        shards: &ShardSet,
        widths: &RecordWidths,
        stats: &CountStats,
    ) -> Result<()> {
        ws.pairs.clear();
        for &handle in self.store.reads_of(cbc) {
            self.store.decode(handle, &mut ws.read_buf)?;
            match self.params.mode {
                CountingMode::Pair => self.enumerate_pairs(ws),
                CountingMode::Single => self.enumerate_kmers(ws),
            }
        }

        sort_and_reduce(&mut ws.pairs, &mut ws.counts, self.params.max_count);

        stats
            .emitted_counts
            .fetch_add(ws.counts.len() as u64, Ordering::Relaxed);
        let mut sum = 0u64;
        for &(leader, follower, count) in &ws.counts {
            sum += count;
            let shard = shard_of(leader, self.params.n_splits);
            ws.record_buffers[shard].push(BkcRecord {
                sample_id: self.params.sample_id,
                cbc,
                leader,
                follower,
                count,
            });
        }
        stats.summed_counts.fetch_add(sum, Ordering::Relaxed);

        for shard in 0..ws.record_buffers.len() {
            if ws.record_buffers[shard].len() >= self.params.max_records_in_buffer {
                flush_buffer(ws, shard, shards, widths)?;
            }
        }
        Ok(())
    }

    /// Emits every (leader, follower) pair of the read in `ws.read_buf`
    /// whose leader passes the anchor gate and the filters.
    ///
    /// The leader window covers bases `[p, p+L)` and the follower window
    /// `[p+L+G, p+L+G+F)`; both roll across the read in one pass, the
    /// follower running `L+G` bases ahead of the leader.
    fn enumerate_pairs(&self, ws: &mut Workspace) {
        let Workspace {
            read_buf,
            pairs,
            local_not_accepted,
            local_filtered,
            ..
        } = ws;
        let bases = read_buf.as_slice();

        let leader_len = self.params.leader_len;
        let follower_len = self.params.follower_len;
        let lag = follower_len + self.params.gap_len;
        if bases.len() < self.params.min_read_span() {
            return;
        }

        let mut leader = KmerWindow::new(leader_len as u32, KmerMode::Direct);
        let mut follower = KmerWindow::new(follower_len as u32, KmerMode::Direct);

        for i in 0..bases.len() {
            let t_symbol = dna_code(bases[i]);
            if t_symbol < 4 {
                follower.insert(t_symbol);
            } else {
                follower.reset();
            }

            if i >= lag {
                let a_symbol = dna_code(bases[i - lag]);
                if a_symbol < 4 {
                    leader.insert(a_symbol);
                } else {
                    leader.reset();
                }
            }

            if leader.is_full() && follower.is_full() {
                if let Some(value) =
                    self.accept_leader(leader.value(), (&mut *local_not_accepted, &mut *local_filtered))
                {
                    pairs.push((value, follower.value()));
                }
            }
        }
    }

    /// Single-mode enumeration: one rolling window of `leader_len` bases.
    fn enumerate_kmers(&self, ws: &mut Workspace) {
        let Workspace {
            read_buf,
            pairs,
            local_not_accepted,
            local_filtered,
            ..
        } = ws;

        let mut window = KmerWindow::new(self.params.leader_len as u32, self.params.kmer_mode());
        for &base in read_buf.iter() {
            let symbol = dna_code(base);
            if symbol < 4 {
                window.insert(symbol);
            } else {
                window.reset();
            }
            if window.is_full() {
                if let Some(value) =
                    self.accept_leader(window.value(), (&mut *local_not_accepted, &mut *local_filtered))
                {
                    pairs.push((value, 0));
                }
            }
        }
    }

    /// Applies the anchor gate and the leader filters; returns the leader
    /// when it survives both.
    #[inline]
    fn accept_leader(
        &self,
        leader: u64,
        (not_accepted, filtered): (&mut u64, &mut u64),
    ) -> Option<u64> {
        if let Some(dict) = self.dict {
            if !dict.is_accepted(leader) {
                *not_accepted += 1;
                return None;
            }
        }
        if !self.filter.is_noop() && self.filter.is_rejected(leader) {
            *filtered += 1;
            return None;
        }
        Some(leader)
    }

    fn final_flush(
        &self,
        ws: &mut Workspace,
        shards: &ShardSet,
        widths: &RecordWidths,
    ) -> Result<()> {
        for shard in 0..ws.record_buffers.len() {
            flush_buffer(ws, shard, shards, widths)?;
        }
        Ok(())
    }
}

/// Sorts the pair list lexicographically and collapses runs into counts
/// clamped at `max_count`. Clears `pairs` afterwards so the buffer can be
/// reused for the next CBC.
fn sort_and_reduce(pairs: &mut Vec<(u64, u64)>, counts: &mut Vec<(u64, u64, u64)>, max_count: u64) {
    pairs.sort_unstable();
    counts.clear();
    for &(leader, follower) in pairs.iter() {
        match counts.last_mut() {
            Some((l, f, count)) if *l == leader && *f == follower => {
                *count = (*count + 1).min(max_count);
            }
            _ => counts.push((leader, follower, 1)),
        }
    }
    pairs.clear();
}

fn flush_buffer(
    ws: &mut Workspace,
    shard: usize,
    shards: &ShardSet,
    widths: &RecordWidths,
) -> Result<()> {
    let Workspace {
        record_buffers,
        packed,
        ..
    } = ws;
    let buffer = &mut record_buffers[shard];
    if buffer.is_empty() {
        return Ok(());
    }
    pack_records(buffer, widths, packed);
    shards.writer(shard).add_packed(packed, buffer.len() as u32)?;
    buffer.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_and_reduce_counts_runs() {
        let mut pairs = vec![(2, 1), (1, 1), (2, 1), (1, 1), (1, 2), (2, 1)];
        let mut counts = Vec::new();
        sort_and_reduce(&mut pairs, &mut counts, 100);
        assert_eq!(counts, vec![(1, 1, 2), (1, 2, 1), (2, 1, 3)]);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_sort_and_reduce_saturates() {
        let mut pairs = vec![(5, 5); 10];
        let mut counts = Vec::new();
        sort_and_reduce(&mut pairs, &mut counts, 3);
        assert_eq!(counts, vec![(5, 5, 3)]);
    }

    #[test]
    fn test_sort_and_reduce_empty() {
        let mut pairs = Vec::new();
        let mut counts = vec![(1, 1, 1)];
        sort_and_reduce(&mut pairs, &mut counts, 10);
        assert!(counts.is_empty());
    }
}
