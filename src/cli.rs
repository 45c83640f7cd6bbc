//! # Command line interface for `seqknit`
use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "seqknit",
    author,
    version,
    about = "Induce a variation graph from sequences and their pairwise alignments",
    long_about = None
)]
pub struct Cli {
    /// Input sequences. Expected format is FASTA, optionally gzipped
    #[arg(short, long)]
    pub seqs: String,

    /// Pairwise alignments of the input sequences. Expected format is PAF
    /// with CIGARs over {M, I, D}, optionally gzipped
    #[arg(short, long)]
    pub paf: String,

    /// Output file for the graph sequence (raw bytes, one per graph base)
    #[arg(short, long)]
    pub graph_seq: String,

    /// Output file for the node index, mapping graph ranges to input positions
    #[arg(long)]
    pub node_index: String,

    /// Output file for the path index, mapping input ranges to graph positions
    #[arg(long)]
    pub path_index: String,

    /// Minimum length of an exact match to record from an alignment
    #[arg(short = 'k', long, default_value_t = 1)]
    pub min_match_len: u64,

    /// Number of fresh input bases to close per batch
    #[arg(short = 'B', long, default_value_t = 1 << 20)]
    pub batch_size: u64,

    /// Number of threads to use
    #[arg(short, long, default_value_t = 1, value_parser = threads_in_range)]
    pub threads: usize,
}

fn threads_in_range(s: &str) -> Result<usize> {
    let threads = s
        .parse()
        .context("Could not parse value passed to --threads to integer")?;
    if threads < 1 {
        bail!("--threads must be at least 1");
    }
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_must_be_positive() {
        assert!(threads_in_range("0").is_err());
        assert!(threads_in_range("x").is_err());
        assert_eq!(3, threads_in_range("3").unwrap());
    }
}
