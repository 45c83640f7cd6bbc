//! # PAF
//!
//! Parsing of pairwise alignment records. A record is one tab-separated
//! line: query name, length, start, end, strand, target name, length,
//! start, end, followed by optional fields among which `cg:Z:` carries the
//! CIGAR. Only `M`, `I`, and `D` operators are meaningful here; anything
//! else is a hard error, as are blank or truncated lines.
use anyhow::{bail, Context, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CigarOp {
    Match(u64),
    Ins(u64),
    Del(u64),
}

impl CigarOp {
    pub fn len(&self) -> u64 {
        match *self {
            CigarOp::Match(len) | CigarOp::Ins(len) | CigarOp::Del(len) => len,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PafRow {
    pub query_name: String,
    pub query_len: u64,
    pub query_start: u64,
    pub query_end: u64,
    /// The strand field: `true` for `+`, `false` for `-`.
    pub same_strand: bool,
    pub target_name: String,
    pub target_len: u64,
    pub target_start: u64,
    pub target_end: u64,
    pub cigar: Vec<CigarOp>,
}

impl PafRow {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 10 {
            bail!(
                "expected at least 10 tab-separated fields, found {}",
                fields.len()
            );
        }

        let number = |idx: usize, what: &str| -> Result<u64> {
            fields[idx]
                .parse::<u64>()
                .with_context(|| format!("could not parse {what} '{}'", fields[idx]))
        };

        let same_strand = match fields[4] {
            "+" => true,
            "-" => false,
            other => bail!("invalid strand field '{other}'"),
        };

        // the CIGAR normally rides in a cg:Z: tag; a bare operator string
        // in the tenth column is accepted too
        let cigar_text = fields[9..]
            .iter()
            .find_map(|f| f.strip_prefix("cg:Z:"))
            .or_else(|| if fields.len() == 10 { Some(fields[9]) } else { None })
            .context("record has no CIGAR")?;

        let row = PafRow {
            query_name: fields[0].to_owned(),
            query_len: number(1, "query length")?,
            query_start: number(2, "query start")?,
            query_end: number(3, "query end")?,
            same_strand,
            target_name: fields[5].to_owned(),
            target_len: number(6, "target length")?,
            target_start: number(7, "target start")?,
            target_end: number(8, "target end")?,
            cigar: parse_cigar(cigar_text)?,
        };

        if row.query_start > row.query_end || row.query_end > row.query_len {
            bail!(
                "query range [{}, {}) outside sequence of length {}",
                row.query_start,
                row.query_end,
                row.query_len
            );
        }
        if row.target_start > row.target_end || row.target_end > row.target_len {
            bail!(
                "target range [{}, {}) outside sequence of length {}",
                row.target_start,
                row.target_end,
                row.target_len
            );
        }

        Ok(row)
    }
}

pub fn parse_cigar(text: &str) -> Result<Vec<CigarOp>> {
    let mut ops = Vec::new();
    let mut len = 0u64;
    let mut have_len = false;
    for c in text.chars() {
        if let Some(digit) = c.to_digit(10) {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(u64::from(digit)))
                .with_context(|| format!("operator length overflow in CIGAR '{text}'"))?;
            have_len = true;
        } else {
            if !have_len {
                bail!("operator '{c}' without a length in CIGAR '{text}'");
            }
            let op = match c {
                'M' => CigarOp::Match(len),
                'I' => CigarOp::Ins(len),
                'D' => CigarOp::Del(len),
                other => bail!("unsupported CIGAR operator '{other}' in '{text}'"),
            };
            ops.push(op);
            len = 0;
            have_len = false;
        }
    }
    if have_len {
        bail!("trailing length without an operator in CIGAR '{text}'");
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_row_with_cg_tag() {
        let line = "q1\t100\t10\t20\t+\tt1\t200\t30\t40\t10\t10\t60\tcg:Z:10M";
        let row = PafRow::parse(line).unwrap();
        assert_eq!("q1", row.query_name);
        assert_eq!(100, row.query_len);
        assert_eq!(10, row.query_start);
        assert_eq!(20, row.query_end);
        assert!(row.same_strand);
        assert_eq!("t1", row.target_name);
        assert_eq!(vec![CigarOp::Match(10)], row.cigar);
    }

    #[test]
    fn parse_row_with_bare_cigar_column() {
        let line = "q1\t4\t0\t4\t-\tt1\t4\t0\t4\t2M1I1M";
        let row = PafRow::parse(line).unwrap();
        assert!(!row.same_strand);
        assert_eq!(
            vec![CigarOp::Match(2), CigarOp::Ins(1), CigarOp::Match(1)],
            row.cigar
        );
    }

    #[test]
    fn rejects_blank_and_truncated_lines() {
        assert!(PafRow::parse("").is_err());
        assert!(PafRow::parse("q1\t4\t0\t4\t+\tt1\t4\t0\t4").is_err());
    }

    #[test]
    fn rejects_bad_strand_and_coords() {
        assert!(PafRow::parse("q1\t4\t0\t4\t*\tt1\t4\t0\t4\tcg:Z:4M").is_err());
        // end beyond the stated length
        assert!(PafRow::parse("q1\t4\t0\t5\t+\tt1\t4\t0\t4\tcg:Z:4M").is_err());
        assert!(PafRow::parse("q1\t4\t3\t1\t+\tt1\t4\t0\t4\tcg:Z:4M").is_err());
    }

    #[test]
    fn rejects_missing_cigar_among_tags() {
        assert!(PafRow::parse("q1\t4\t0\t4\t+\tt1\t4\t0\t4\t4\t4\t60\ttp:A:P").is_err());
    }

    #[test]
    fn cigar_parsing() {
        assert_eq!(
            vec![CigarOp::Match(3), CigarOp::Del(2), CigarOp::Ins(11)],
            parse_cigar("3M2D11I").unwrap()
        );
        assert!(parse_cigar("M").is_err());
        assert!(parse_cigar("3").is_err());
        assert!(parse_cigar("3S").is_err());
    }
}
