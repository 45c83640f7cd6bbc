use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rayon::ThreadPoolBuilder;

use seqknit::{
    aln,
    cli::Cli,
    seqindex::SequenceIndex,
    transclose::{compute_transitive_closure, ClosureParams},
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build_global()
        .context("Could not build thread pool")?;

    let seqidx = SequenceIndex::from_fasta(&cli.seqs)?;
    info!(
        "Read {} sequences ({} bp) from {}",
        seqidx.n_seqs(),
        seqidx.length(),
        cli.seqs
    );

    let paf_in = aln::open_paf(&cli.paf)?;
    let matches = aln::build_match_index(paf_in, &seqidx, cli.min_match_len, cli.threads)?;

    let seq_out = BufWriter::new(
        File::create(&cli.graph_seq)
            .with_context(|| format!("Could not create graph sequence file {}", cli.graph_seq))?,
    );
    let params = ClosureParams { batch_size: cli.batch_size, threads: cli.threads };
    let output = compute_transitive_closure(&seqidx, &matches, seq_out, &params)?;
    info!("Wrote {} graph bases to {}", output.graph_length, cli.graph_seq);

    output.node_index.write_to_path(&cli.node_index)?;
    output.path_index.write_to_path(&cli.path_index)?;
    info!("Wrote node index to {} and path index to {}", cli.node_index, cli.path_index);

    Ok(())
}
