//! # Aln
//!
//! Alignment ingestion: walk the `M` operators of every alignment record
//! base by base, and record each run of identical bases of sufficient
//! length as a pair of mirror-image intervals in the match index. The
//! closure engine later relies on both halves of every match being
//! present.
//!
//! A producer (the calling thread) reads and parses records and feeds a
//! bounded channel; worker threads do the base-level walks and collect
//! entries thread-locally, which keeps the match index itself
//! single-writer.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::thread;

use anyhow::{bail, Context, Result};
use crossbeam::channel;
use flate2::read::MultiGzDecoder;
use log::{debug, info};

use crate::iitree::{Entry, IntervalIndex};
use crate::paf::{CigarOp, PafRow};
use crate::pos::Pos;
use crate::seqindex::SequenceIndex;

const RECORD_CHANNEL_DEPTH: usize = 1 << 10;

/// Open an alignment file, transparently decompressing gzip by extension.
pub fn open_paf(path: &str) -> Result<Box<dyn BufRead + Send>> {
    let file =
        File::open(path).with_context(|| format!("Could not open alignment file {path}"))?;
    if path.ends_with(".gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Ingest every alignment record from `reader` and return the finalised
/// match index. Malformed records, unknown sequence names, and coordinate
/// mismatches abort ingestion.
pub fn build_match_index<R: BufRead>(
    reader: R,
    seqidx: &SequenceIndex,
    min_match_len: u64,
    threads: usize,
) -> Result<IntervalIndex> {
    let n_workers = threads.max(1);
    let (tx, rx) = channel::bounded::<(u64, PafRow)>(RECORD_CHANNEL_DEPTH);

    let batches = thread::scope(|scope| -> Result<Vec<Vec<Entry>>> {
        let handles: Vec<_> = (0..n_workers)
            .map(|_| {
                let rx = rx.clone();
                scope.spawn(move || -> Result<Vec<Entry>> {
                    let mut entries = Vec::new();
                    let mut failure: Option<anyhow::Error> = None;
                    for (lineno, row) in rx {
                        if failure.is_some() {
                            // keep draining so the producer never blocks
                            continue;
                        }
                        if let Err(e) = emit_row_matches(&row, seqidx, min_match_len, &mut entries)
                        {
                            failure =
                                Some(e.context(format!("Bad alignment record on line {lineno}")));
                        }
                    }
                    match failure {
                        Some(e) => Err(e),
                        None => Ok(entries),
                    }
                })
            })
            .collect();
        drop(rx);

        let mut produced: Result<()> = Ok(());
        let mut n_rows = 0u64;
        for (i, line) in reader.lines().enumerate() {
            let lineno = i as u64 + 1;
            let parsed = line
                .with_context(|| format!("Could not read alignment line {lineno}"))
                .and_then(|line| {
                    PafRow::parse(&line)
                        .with_context(|| format!("Malformed alignment record on line {lineno}"))
                });
            match parsed {
                Ok(row) => {
                    n_rows += 1;
                    if tx.send((lineno, row)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    produced = Err(e);
                    break;
                }
            }
        }
        drop(tx);

        let mut batches = Vec::new();
        let mut worker_failure = None;
        for handle in handles {
            match handle.join().expect("ingestion worker panicked") {
                Ok(batch) => batches.push(batch),
                Err(e) => worker_failure = Some(e),
            }
        }
        produced?;
        if let Some(e) = worker_failure {
            return Err(e);
        }
        debug!("parsed {n_rows} alignment records");
        Ok(batches)
    })?;

    let mut index = IntervalIndex::new();
    for batch in batches {
        for e in batch {
            index.add(e.start, e.end, e.pos);
        }
    }
    index.index();
    info!("Match index holds {} intervals", index.len());
    Ok(index)
}

/// Walk one record's operator list and append the match intervals it
/// contributes. Runs shorter than `min_match_len` are discarded; a base
/// aligned to itself never produces a match.
fn emit_row_matches(
    row: &PafRow,
    seqidx: &SequenceIndex,
    min_match_len: u64,
    out: &mut Vec<Entry>,
) -> Result<()> {
    let query_rank = seqidx
        .rank_of_name(&row.query_name)
        .with_context(|| format!("Unknown query sequence '{}'", row.query_name))?;
    let target_rank = seqidx
        .rank_of_name(&row.target_name)
        .with_context(|| format!("Unknown target sequence '{}'", row.target_name))?;
    if row.query_len != seqidx.seq_length_by_rank(query_rank) {
        bail!(
            "Query length {} does not match indexed sequence '{}' ({} bp)",
            row.query_len,
            row.query_name,
            seqidx.seq_length_by_rank(query_rank)
        );
    }
    if row.target_len != seqidx.seq_length_by_rank(target_rank) {
        bail!(
            "Target length {} does not match indexed sequence '{}' ({} bp)",
            row.target_len,
            row.target_name,
            seqidx.seq_length_by_rank(target_rank)
        );
    }

    let q_rev = !row.same_strand;
    // a reverse-strand query walks from its last base toward its first
    let q_all = if q_rev {
        seqidx.pos_in_all_seqs(query_rank, row.query_end, false) - 1
    } else {
        seqidx.pos_in_all_seqs(query_rank, row.query_start, false)
    };
    let t_all = seqidx.pos_in_all_seqs(target_rank, row.target_start, false);
    let mut q_pos = Pos::new(q_all, q_rev);
    let mut t_pos = Pos::new(t_all, false);

    let mut run_start_q = q_pos;
    let mut run_start_t = t_pos;
    let mut run_len = 0u64;

    for op in &row.cigar {
        match *op {
            CigarOp::Match(len) => {
                for _ in 0..len {
                    if seqidx.base_at_pos(q_pos) == seqidx.base_at_pos(t_pos)
                        && q_pos.offset() != t_pos.offset()
                    {
                        if run_len == 0 {
                            run_start_q = q_pos;
                            run_start_t = t_pos;
                        }
                        run_len += 1;
                    } else {
                        close_run(run_len, min_match_len, run_start_q, run_start_t, q_pos, t_pos, out);
                        run_len = 0;
                    }
                    q_pos = q_pos.incr();
                    t_pos = t_pos.incr();
                }
                close_run(run_len, min_match_len, run_start_q, run_start_t, q_pos, t_pos, out);
                run_len = 0;
            }
            CigarOp::Ins(len) => {
                q_pos = q_pos.incr_by(len);
            }
            CigarOp::Del(len) => {
                t_pos = t_pos.incr_by(len);
            }
        }
    }
    Ok(())
}

/// Emit the two mirror-image entries for a closed run, if it is long
/// enough. `q_pos` and `t_pos` are one step past the run's last base.
fn close_run(
    run_len: u64,
    min_match_len: u64,
    run_start_q: Pos,
    run_start_t: Pos,
    q_pos: Pos,
    t_pos: Pos,
    out: &mut Vec<Entry>,
) {
    if run_len == 0 || run_len < min_match_len {
        return;
    }
    if q_pos.is_rev() {
        // a reverse run covers [offset(q_pos)+1, offset(start)+1); stepping
        // back in position space avoids underflow when the run ends at 0
        let q_low = q_pos.decr();
        out.push(Entry {
            start: q_low.offset(),
            end: run_start_q.offset() + 1,
            pos: Pos::new(t_pos.offset() - 1, true),
        });
        out.push(Entry {
            start: run_start_t.offset(),
            end: t_pos.offset(),
            pos: Pos::new(run_start_q.offset(), true),
        });
    } else {
        out.push(Entry {
            start: run_start_q.offset(),
            end: q_pos.offset(),
            pos: run_start_t,
        });
        out.push(Entry {
            start: run_start_t.offset(),
            end: t_pos.offset(),
            pos: run_start_q,
        });
    }
}
