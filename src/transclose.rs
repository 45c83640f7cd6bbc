//! # Transclose
//!
//! The transitive closure engine. Matched bases form equivalence classes:
//! if base X aligns to Y and Y to Z, all three collapse into one base of
//! the output graph sequence S. The engine walks Q in batches sized by
//! fresh (not yet closed) bases, expands each batch's closure frontier in
//! parallel over the match index, unites the discovered positions with a
//! lock-free disjoint-set structure, and emits one representative base per
//! component in a deterministic order. Run-length compressed mappings
//! between Q and S accumulate in a range buffer and are flushed into the
//! node index (S ranges to Q positions) and path index (Q ranges to S
//! positions) whenever a run stops extending.
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::queue::ArrayQueue;
use log::{debug, info, trace};
use rayon::prelude::*;

use crate::bits::AtomicBitmap;
use crate::dset::DisjointSets;
use crate::iitree::{Entry, IntervalIndex};
use crate::pos::Pos;
use crate::seqindex::SequenceIndex;

/// A frontier range still to be explored: the aligned-side position of a
/// recorded match plus its length.
type WorkItem = (Pos, u64);

const TODO_CAPACITY: usize = 1 << 16;
const IDLE_POLL: Duration = Duration::from_millis(1);

pub struct ClosureParams {
    /// Number of fresh Q bases gathered per batch.
    pub batch_size: u64,
    /// Worker threads for frontier expansion and the union phase.
    pub threads: usize,
}

impl Default for ClosureParams {
    fn default() -> Self {
        ClosureParams { batch_size: 1 << 20, threads: 1 }
    }
}

pub struct ClosureOutput {
    /// Length of the emitted graph sequence S.
    pub graph_length: u64,
    /// S ranges mapped to Q positions.
    pub node_index: IntervalIndex,
    /// Q ranges mapped to S positions.
    pub path_index: IntervalIndex,
}

/// Compute the transitive closure of `matches` over the sequences of
/// `seqidx`, writing the graph sequence to `seq_out`. The emitted S and
/// both indexes are deterministic functions of the input, independent of
/// thread count.
pub fn compute_transitive_closure<W: Write + Sync>(
    seqidx: &SequenceIndex,
    matches: &IntervalIndex,
    seq_out: W,
    params: &ClosureParams,
) -> Result<ClosureOutput> {
    Closure::new(seqidx, matches, seq_out, params).run()
}

/// A run in S that a Q range is currently extending into.
#[derive(Clone, Copy)]
struct SpanInS {
    start: u64,
    len: u64,
}

struct Closure<'a, W: Write + Sync> {
    seqidx: &'a SequenceIndex,
    matches: &'a IntervalIndex,
    params: &'a ClosureParams,
    /// Bases already assigned to an emitted component. Monotone.
    q_seen: AtomicBitmap,
    /// Bases claimed by the current batch's frontier. Reset per batch.
    q_curr: AtomicBitmap,
    node_index: IntervalIndex,
    path_index: IntervalIndex,
    /// Growing (Q run, S run) pairings, keyed by the last emitted
    /// Q-position of each run.
    range_buffer: BTreeMap<Pos, SpanInS>,
    seq_out: W,
    graph_length: u64,
    last_seq_id: usize,
}

impl<'a, W: Write + Sync> Closure<'a, W> {
    fn new(
        seqidx: &'a SequenceIndex,
        matches: &'a IntervalIndex,
        seq_out: W,
        params: &'a ClosureParams,
    ) -> Self {
        let len = seqidx.length();
        Closure {
            seqidx,
            matches,
            params,
            q_seen: AtomicBitmap::new(len),
            q_curr: AtomicBitmap::new(len),
            node_index: IntervalIndex::new(),
            path_index: IntervalIndex::new(),
            range_buffer: BTreeMap::new(),
            seq_out,
            graph_length: 0,
            last_seq_id: 0,
        }
    }

    fn run(mut self) -> Result<ClosureOutput> {
        let total = self.seqidx.length();
        info!("Closing over {total} input bases");
        let mut i = 0u64;
        while i < total {
            while i < total && self.q_seen.get(i) {
                i += 1;
            }
            if i >= total {
                break;
            }
            let chunk_start = i;
            let chunk_end = self.next_batch_end(chunk_start);
            debug!("batch [{chunk_start}, {chunk_end})");
            self.q_curr.clear_all();
            self.close_batch(chunk_start, chunk_end)?;
            i = chunk_end;
        }
        // past-the-end flush: no surviving run can satisfy it
        let graph_length = self.graph_length;
        self.flush_ranges(graph_length + 1);
        assert!(
            self.range_buffer.is_empty(),
            "range buffer still holds runs after the final flush"
        );
        self.node_index.index();
        self.path_index.index();
        self.seq_out.flush().context("Could not flush graph sequence")?;
        info!(
            "Emitted {graph_length} graph bases, {} node ranges, {} path ranges",
            self.node_index.len(),
            self.path_index.len()
        );
        Ok(ClosureOutput {
            graph_length,
            node_index: self.node_index,
            path_index: self.path_index,
        })
    }

    /// Advance past `chunk_start` until the batch holds `batch_size` fresh
    /// bases or Q ends; already-closed stretches don't count.
    fn next_batch_end(&self, chunk_start: u64) -> u64 {
        let total = self.seqidx.length();
        let mut end = chunk_start;
        let mut fresh = 0u64;
        while end < total && fresh < self.params.batch_size {
            if !self.q_seen.get(end) {
                fresh += 1;
            }
            end += 1;
        }
        end
    }

    fn close_batch(&mut self, chunk_start: u64, chunk_end: u64) -> Result<()> {
        let ovlp = self.expand_frontier(chunk_start, chunk_end);
        debug!("frontier closed with {} overlap ranges", ovlp.len());

        // densify the claimed positions: dense id of offset p is the
        // number of claimed offsets below p
        let curr = self.q_curr.snapshot();
        let n = curr.count_ones();
        assert!(n > 0, "batch produced no claimed positions");
        assert!(n <= u32::MAX as u64, "batch claimed too many positions for dense ids");
        let sets = DisjointSets::new(n as usize);

        // unite both sides of every recorded overlap
        ovlp.par_iter().for_each(|s| {
            let mut p = s.pos;
            for j in s.start..s.end {
                sets.unite(curr.rank1(j) as u32, curr.rank1(p.offset()) as u32);
                p = p.incr();
            }
        });

        // read out (component, position) pairs for the fresh claims
        let mut dsets: Vec<(u64, u64)> = curr
            .ones()
            .filter(|&p| !self.q_seen.get(p))
            .map(|p| (u64::from(sets.find(curr.rank1(p) as u32)), p))
            .collect();
        assert!(!dsets.is_empty());
        dsets.par_sort_unstable();

        // compact the component ids
        let mut next_id = 0u64;
        let mut last_root = dsets[0].0;
        for d in &mut dsets {
            if d.0 != last_root {
                next_id += 1;
                last_root = d.0;
            }
            d.0 = next_id;
        }

        // renumber components by their earliest position in Q so that the
        // emission order, and with it S, is independent of scheduling
        let n_components = (next_id + 1) as usize;
        let mut by_min_pos: Vec<(u64, u64)> = (0..n_components as u64).map(|c| (u64::MAX, c)).collect();
        for d in &dsets {
            let slot = &mut by_min_pos[d.0 as usize];
            slot.0 = slot.0.min(d.1);
        }
        by_min_pos.par_sort_unstable();
        let mut renamed = vec![0u64; n_components];
        for (new_id, &(_, old_id)) in by_min_pos.iter().enumerate() {
            renamed[old_id as usize] = new_id as u64;
        }
        for d in &mut dsets {
            d.0 = renamed[d.0 as usize];
        }
        dsets.par_sort_unstable();
        debug!("batch resolved into {n_components} components");

        self.emit(&dsets)?;

        // everything claimed this batch is now closed
        self.q_seen.union_with(&self.q_curr);
        Ok(())
    }

    /// Parallel frontier expansion: seed the batch's fresh sub-ranges,
    /// then let workers pull ranges from the shared queue, look up their
    /// overlaps in the match index, and claim the aligned counterparts
    /// until nothing new is discovered.
    fn expand_frontier(&self, chunk_start: u64, chunk_end: u64) -> Vec<Entry> {
        // claim the batch's own fresh sub-ranges first; they must close
        // even when nothing aligns onto them
        let mut seeds: Vec<WorkItem> = Vec::new();
        self.for_each_fresh_range(chunk_start, chunk_end, Pos::new(0, false), |b| {
            for i in b.start..b.end {
                self.q_curr.set(i);
            }
            seeds.push((Pos::new(b.start, false), b.end - b.start));
        });

        let n_workers = self.params.threads.max(1);
        let todo: ArrayQueue<WorkItem> = ArrayQueue::new(TODO_CAPACITY);
        let busy: Vec<AtomicBool> = (0..n_workers).map(|_| AtomicBool::new(true)).collect();
        let stop = AtomicBool::new(false);

        let mut ovlp: Vec<Entry> = Vec::new();
        thread::scope(|scope| {
            let handles: Vec<_> = (0..n_workers)
                .map(|tid| {
                    let todo = &todo;
                    let busy = busy.as_slice();
                    let stop = &stop;
                    scope.spawn(move || self.explore(tid, todo, busy, stop))
                })
                .collect();

            // the workers are draining already, so a full queue only needs
            // patience
            for mut item in seeds {
                loop {
                    match todo.push(item) {
                        Ok(()) => break,
                        Err(rejected) => {
                            item = rejected;
                            thread::sleep(IDLE_POLL);
                        }
                    }
                }
            }

            // let the seeds become visible before trusting an empty queue
            thread::sleep(IDLE_POLL);
            loop {
                if todo.is_empty() && busy.iter().all(|b| !b.load(Ordering::Acquire)) {
                    stop.store(true, Ordering::Release);
                    break;
                }
                thread::sleep(IDLE_POLL);
            }

            for handle in handles {
                ovlp.extend(handle.join().expect("frontier worker panicked"));
            }
        });
        ovlp
    }

    /// One frontier worker: pop a range, look up everything the match
    /// index aligns onto it, and hand each fresh slice to `handle_range`.
    /// The busy flag goes up before the pop and comes down only once both
    /// the pop failed and the local overflow is empty, so the supervisor
    /// cannot observe quiescence while an item is in flight.
    fn explore(
        &self,
        tid: usize,
        todo: &ArrayQueue<WorkItem>,
        busy: &[AtomicBool],
        stop: &AtomicBool,
    ) -> Vec<Entry> {
        trace!("frontier worker {tid} up");
        let mut ovlp: Vec<Entry> = Vec::new();
        let mut overflow: Vec<WorkItem> = Vec::new();
        loop {
            busy[tid].store(true, Ordering::Release);
            while let Some(&item) = overflow.last() {
                if todo.push(item).is_ok() {
                    overflow.pop();
                } else {
                    break;
                }
            }
            if let Some((pos, len)) = todo.pop() {
                let range_start = if pos.is_rev() { pos.offset() + 1 - len } else { pos.offset() };
                let range_end = range_start + len;
                for id in self.matches.overlap(range_start, range_end) {
                    let m = self.matches.get(id);
                    self.for_each_fresh_range(m.start, m.end, m.pos, |s| {
                        self.handle_range(s, range_start, range_end, &mut ovlp, todo, &mut overflow);
                    });
                }
            } else if overflow.is_empty() {
                busy[tid].store(false, Ordering::Release);
                if stop.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(IDLE_POLL);
            }
        }
        trace!("frontier worker {tid} done with {} ranges", ovlp.len());
        ovlp
    }

    /// Split `[start, end)` (with aligned counterpart starting at `pos`)
    /// into its maximal sub-ranges of bases not yet closed in earlier
    /// batches, invoking `f` for each.
    fn for_each_fresh_range(&self, start: u64, end: u64, pos: Pos, mut f: impl FnMut(Entry)) {
        let mut p = start;
        let mut t = pos;
        while p < end {
            if self.q_seen.get(p) {
                p += 1;
                t = t.incr();
            } else {
                let fresh_start = p;
                let fresh_pos = t;
                while p < end && !self.q_seen.get(p) {
                    p += 1;
                    t = t.incr();
                }
                f(Entry { start: fresh_start, end: p, pos: fresh_pos });
            }
        }
    }

    /// Trim a fresh match slice to the queried range, record it for the
    /// union phase, and claim its aligned side in `q_curr`. Any newly
    /// claimed base means that side still needs its own exploration.
    fn handle_range(
        &self,
        mut s: Entry,
        query_start: u64,
        query_end: u64,
        ovlp: &mut Vec<Entry>,
        todo: &ArrayQueue<WorkItem>,
        overflow: &mut Vec<WorkItem>,
    ) {
        if s.start >= query_end || s.end <= query_start {
            return;
        }
        if query_start > s.start {
            let trim = query_start - s.start;
            s.start += trim;
            s.pos = s.pos.incr_by(trim);
        }
        if s.end > query_end {
            s.end = query_end;
        }
        debug_assert!(s.start < s.end);
        ovlp.push(s);

        let len = s.end - s.start;
        let t_start = if s.pos.is_rev() { s.pos.offset() + 1 - len } else { s.pos.offset() };
        let mut all_claimed = true;
        for i in t_start..t_start + len {
            all_claimed &= self.q_curr.set(i);
        }
        if !all_claimed {
            let item = (s.pos, len);
            if todo.push(item).is_err() {
                overflow.push(item);
            }
        }
    }

    /// Walk the renamed components in order, append one representative
    /// base per component to S, and extend or flush the range buffer for
    /// every member position.
    fn emit(&mut self, dsets: &[(u64, u64)]) -> Result<()> {
        let mut last_dset_id = u64::MAX;
        let mut current_base = 0u8;
        for &(dset_id, q_off) in dsets {
            if dset_id != last_dset_id {
                current_base = self.seqidx.base_at(q_off);
                self.seq_out
                    .write_all(std::slice::from_ref(&current_base))
                    .context("Could not write graph sequence")?;
                self.graph_length += 1;
                let curr_seq_id = self.seqidx.seq_id_at(q_off);
                if curr_seq_id != self.last_seq_id {
                    // no run may straddle two input sequences; flushing at
                    // the just-written length forces every pending run out
                    self.flush_ranges(self.graph_length);
                    self.last_seq_id = curr_seq_id;
                } else {
                    self.flush_ranges(self.graph_length - 1);
                }
                last_dset_id = dset_id;
            }
            // pick the strand on which this position reads as the
            // representative base
            let q_pos = if self.seqidx.base_at_pos(Pos::new(q_off, false)) == current_base {
                Pos::new(q_off, false)
            } else {
                Pos::new(q_off, true)
            };
            assert_eq!(
                self.seqidx.base_at_pos(q_pos),
                current_base,
                "strand mismatch while emitting offset {q_off}"
            );
            self.extend_range(self.graph_length - 1, q_pos);
        }
        Ok(())
    }

    /// Extend the run ending at the predecessor of `q_pos` into `s_pos`,
    /// or start a new one-base run.
    fn extend_range(&mut self, s_pos: u64, q_pos: Pos) {
        let q_last = q_pos.decr();
        match self.range_buffer.get(&q_last).copied() {
            Some(run) if run.start + run.len == s_pos => {
                self.range_buffer.remove(&q_last);
                self.range_buffer.insert(q_pos, SpanInS { start: run.start, len: run.len + 1 });
            }
            _ => {
                self.range_buffer.insert(q_pos, SpanInS { start: s_pos, len: 1 });
            }
        }
    }

    /// Materialise every buffered run that can no longer extend into
    /// `s_pos` as one node-index and one path-index range. Runs whose end
    /// sits exactly at `s_pos` are still growing and survive.
    fn flush_ranges(&mut self, s_pos: u64) {
        let Self { range_buffer, node_index, path_index, .. } = self;
        range_buffer.retain(|&q_end_pos, run| {
            if run.start + run.len == s_pos {
                return true;
            }
            let s_start = run.start;
            let s_end = s_start + run.len;
            if q_end_pos.is_rev() {
                // the key of a reverse run is its last position, i.e. the
                // lowest Q offset it covers
                let q_start = q_end_pos.offset();
                let q_end = q_start + run.len;
                node_index.add(s_start, s_end, Pos::new(q_end - 1, true));
                path_index.add(q_start, q_end, Pos::new(s_end - 1, true));
            } else {
                let q_end = q_end_pos.offset() + 1;
                let q_start = q_end - run.len;
                node_index.add(s_start, s_end, Pos::new(q_start, false));
                path_index.add(q_start, q_end, Pos::new(s_start, false));
            }
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_seqidx() -> SequenceIndex {
        let mut seqidx = SequenceIndex::new();
        seqidx.push_sequence("s1", b"ACGT").unwrap();
        seqidx
    }

    fn empty_matches() -> IntervalIndex {
        let mut matches = IntervalIndex::new();
        matches.index();
        matches
    }

    #[test]
    fn extend_merges_contiguous_runs() {
        let seqidx = tiny_seqidx();
        let matches = empty_matches();
        let params = ClosureParams::default();
        let mut closure = Closure::new(&seqidx, &matches, Vec::<u8>::new(), &params);

        closure.extend_range(0, Pos::new(0, false));
        closure.extend_range(1, Pos::new(1, false));
        closure.extend_range(2, Pos::new(2, false));
        assert_eq!(1, closure.range_buffer.len());

        closure.flush_ranges(4);
        assert!(closure.range_buffer.is_empty());
        assert_eq!(
            &[Entry { start: 0, end: 3, pos: Pos::new(0, false) }],
            closure.node_index.entries()
        );
        assert_eq!(
            &[Entry { start: 0, end: 3, pos: Pos::new(0, false) }],
            closure.path_index.entries()
        );
    }

    #[test]
    fn growing_runs_survive_a_flush() {
        let seqidx = tiny_seqidx();
        let matches = empty_matches();
        let params = ClosureParams::default();
        let mut closure = Closure::new(&seqidx, &matches, Vec::<u8>::new(), &params);

        closure.extend_range(0, Pos::new(0, false));
        closure.extend_range(1, Pos::new(1, false));
        // a run ending exactly at the flush point is still growing
        closure.flush_ranges(2);
        assert_eq!(1, closure.range_buffer.len());
        assert!(closure.node_index.is_empty());
    }

    #[test]
    fn broken_extension_starts_a_fresh_run() {
        let seqidx = tiny_seqidx();
        let matches = empty_matches();
        let params = ClosureParams::default();
        let mut closure = Closure::new(&seqidx, &matches, Vec::<u8>::new(), &params);

        closure.extend_range(0, Pos::new(0, false));
        // S jumped; the old run cannot extend
        closure.extend_range(5, Pos::new(1, false));
        closure.flush_ranges(7);
        let mut node = closure.node_index.entries().to_vec();
        node.sort_unstable();
        assert_eq!(
            vec![
                Entry { start: 0, end: 1, pos: Pos::new(0, false) },
                Entry { start: 5, end: 6, pos: Pos::new(1, false) },
            ],
            node
        );
    }

    #[test]
    fn reverse_runs_flush_mirrored() {
        let seqidx = tiny_seqidx();
        let matches = empty_matches();
        let params = ClosureParams::default();
        let mut closure = Closure::new(&seqidx, &matches, Vec::<u8>::new(), &params);

        // a reverse run walks to lower offsets as S grows
        closure.extend_range(0, Pos::new(3, true));
        closure.extend_range(1, Pos::new(2, true));
        closure.extend_range(2, Pos::new(1, true));
        closure.flush_ranges(4);
        assert_eq!(
            &[Entry { start: 0, end: 3, pos: Pos::new(3, true) }],
            closure.node_index.entries()
        );
        assert_eq!(
            &[Entry { start: 1, end: 4, pos: Pos::new(2, true) }],
            closure.path_index.entries()
        );
    }

    #[test]
    fn batch_boundary_counts_only_fresh_bases() {
        let mut seqidx = SequenceIndex::new();
        seqidx.push_sequence("s1", b"ACGTACGT").unwrap();
        let matches = empty_matches();
        let params = ClosureParams { batch_size: 2, threads: 1 };
        let closure = Closure::new(&seqidx, &matches, Vec::<u8>::new(), &params);

        closure.q_seen.set(1);
        closure.q_seen.set(2);
        // bases 1 and 2 are closed, so the two fresh bases are 0 and 3
        assert_eq!(4, closure.next_batch_end(0));
    }
}
