//! # seqknit
//!
//! This library backs the `seqknit` binary, which induces a variation
//! graph from a set of input sequences and pairwise alignments between
//! them. Matched bases are collapsed by transitive closure: each closure
//! component contributes one base to the output graph sequence, and two
//! interval indexes relate ranges of the concatenated input space to
//! ranges of the graph sequence in both directions.
pub mod aln;
pub mod bits;
pub mod cli;
pub mod dset;
pub mod iitree;
pub mod paf;
pub mod pos;
pub mod seqindex;
pub mod transclose;
