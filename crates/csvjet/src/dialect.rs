//! Dialect configuration, per-byte parse flags, and dialect inference.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decoder::{CsvDecoder, RowArena};
use crate::errors::{CsvError, Result};

/// Candidate delimiters tried when guessing an unknown dialect.
pub const DEFAULT_DELIMITER_CANDIDATES: &[u8] = &[b',', b'|', b'\t', b';', b'^'];

/// Number of sample rows scored per candidate when guessing.
const GUESS_ROW_LIMIT: usize = 100;

/// Sample bytes considered when guessing.
pub(crate) const GUESS_SAMPLE_BYTES: usize = 64 * 1024;

/// Classification of a byte with respect to CSV parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseFlags {
    #[default]
    NotSpecial,
    Delimiter,
    Quote,
    Newline,
    PossibleWhitespace,
}

/// 256-entry classification table derived from the active dialect.
///
/// Built once at parser construction, immutable afterwards. Indexed by the
/// unsigned byte value.
#[derive(Debug, Clone)]
pub(crate) struct ParseFlagTable([ParseFlags; 256]);

impl ParseFlagTable {
    #[inline]
    pub fn get(&self, b: u8) -> ParseFlags {
        self.0[b as usize]
    }
}

/// Byte-level dialect for a single parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectOptions {
    /// Delimiter byte.
    pub delimiter: u8,
    /// Quote byte.
    pub quote: u8,
    /// Bytes eligible for edge-trimming in unquoted fields. Empty disables
    /// trimming.
    pub trim: Vec<u8>,
    /// Escalate leniency violations to hard errors.
    pub strict: bool,
    /// Strip a UTF-8 BOM at the start of the stream.
    pub detect_bom: bool,
}

impl Default for DialectOptions {
    fn default() -> Self {
        DialectOptions {
            delimiter: b',',
            quote: b'"',
            trim: Vec::new(),
            strict: false,
            detect_bom: true,
        }
    }
}

impl DialectOptions {
    /// Build the per-byte classification table, validating that the dialect
    /// is unambiguous.
    pub(crate) fn parse_flags(&self) -> Result<ParseFlagTable> {
        if self.delimiter == b'\r' || self.delimiter == b'\n' {
            return Err(CsvError::InvalidDialect(
                "delimiter cannot be a newline byte".to_string(),
            ));
        }
        if self.quote == b'\r' || self.quote == b'\n' {
            return Err(CsvError::InvalidDialect(
                "quote cannot be a newline byte".to_string(),
            ));
        }
        if self.quote == self.delimiter {
            return Err(CsvError::InvalidDialect(
                "quote and delimiter must differ".to_string(),
            ));
        }
        if self.trim.contains(&self.quote) {
            return Err(CsvError::InvalidDialect(
                "quote cannot be in the trim set".to_string(),
            ));
        }
        if self.trim.contains(&self.delimiter) {
            return Err(CsvError::InvalidDialect(
                "delimiter cannot be in the trim set".to_string(),
            ));
        }
        if self.trim.contains(&b'\r') || self.trim.contains(&b'\n') {
            return Err(CsvError::InvalidDialect(
                "newline bytes cannot be in the trim set".to_string(),
            ));
        }

        let mut table = [ParseFlags::NotSpecial; 256];
        for &ws in &self.trim {
            table[ws as usize] = ParseFlags::PossibleWhitespace;
        }
        table[b'\r' as usize] = ParseFlags::Newline;
        table[b'\n' as usize] = ParseFlags::Newline;
        table[self.delimiter as usize] = ParseFlags::Delimiter;
        table[self.quote as usize] = ParseFlags::Quote;

        Ok(ParseFlagTable(table))
    }

    /// Pick a delimiter and header row by probing a prefix of the input.
    ///
    /// Each candidate parses the sample leniently; its score is the share of
    /// rows having the modal field count. Score ties prefer the larger modal
    /// field count, then candidate list order. The header row is the first
    /// sampled row whose field count equals the modal count.
    pub fn infer_from_sample(sample: &[u8], candidates: &[u8]) -> Result<GuessResult> {
        let sample = &sample[0..usize::min(sample.len(), GUESS_SAMPLE_BYTES)];

        // (score, modal field count, result) of the best candidate so far.
        let mut best: Option<(f64, usize, GuessResult)> = None;

        for &candidate in candidates {
            let dialect = DialectOptions {
                delimiter: candidate,
                strict: false,
                ..Default::default()
            };
            let mut decoder = match CsvDecoder::new(&dialect) {
                Ok(decoder) => decoder,
                Err(_) => continue,
            };
            let mut arena = RowArena::new(dialect.quote);
            if decoder.decode(sample, &mut arena).is_err() {
                continue;
            }
            if decoder.finish(&mut arena).is_err() {
                continue;
            }

            let total = usize::min(arena.num_rows(), GUESS_ROW_LIMIT);
            if total == 0 {
                continue;
            }

            let mut tally: HashMap<usize, usize> = HashMap::new();
            for idx in 0..total {
                *tally.entry(arena.row(idx).len()).or_insert(0) += 1;
            }
            let (modal_count, modal_rows) = tally
                .into_iter()
                .max_by_key(|(count, rows)| (*rows, *count))
                .expect("tally is non-empty");

            let score = modal_rows as f64 / total as f64;
            let header_row = (0..total)
                .find(|idx| arena.row(*idx).len() == modal_count)
                .expect("a row with the modal field count exists");

            let better = match &best {
                None => true,
                Some((best_score, best_modal, _)) => {
                    score > *best_score || (score == *best_score && modal_count > *best_modal)
                }
            };
            if better {
                best = Some((
                    score,
                    modal_count,
                    GuessResult {
                        delimiter: candidate,
                        header_row,
                    },
                ));
            }
        }

        match best {
            Some((_, _, result)) => {
                debug!(
                    delimiter = result.delimiter,
                    header_row = result.header_row,
                    "inferred csv dialect"
                );
                Ok(result)
            }
            None => Err(CsvError::InvalidDialect(
                "unable to infer a delimiter from the provided sample".to_string(),
            )),
        }
    }
}

/// Outcome of dialect inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessResult {
    pub delimiter: u8,
    pub header_row: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_table_classifies() {
        let dialect = DialectOptions {
            trim: vec![b' '],
            ..Default::default()
        };
        let table = dialect.parse_flags().unwrap();
        assert_eq!(ParseFlags::Delimiter, table.get(b','));
        assert_eq!(ParseFlags::Quote, table.get(b'"'));
        assert_eq!(ParseFlags::Newline, table.get(b'\r'));
        assert_eq!(ParseFlags::Newline, table.get(b'\n'));
        assert_eq!(ParseFlags::PossibleWhitespace, table.get(b' '));
        assert_eq!(ParseFlags::NotSpecial, table.get(b'x'));
        assert_eq!(ParseFlags::NotSpecial, table.get(0xFF));
    }

    #[test]
    fn ambiguous_dialects_rejected() {
        let same = DialectOptions {
            delimiter: b'"',
            ..Default::default()
        };
        assert!(matches!(
            same.parse_flags(),
            Err(CsvError::InvalidDialect(_))
        ));

        let trimmed_delim = DialectOptions {
            trim: vec![b' ', b','],
            ..Default::default()
        };
        assert!(matches!(
            trimmed_delim.parse_flags(),
            Err(CsvError::InvalidDialect(_))
        ));

        let trimmed_quote = DialectOptions {
            trim: vec![b'"'],
            ..Default::default()
        };
        assert!(matches!(
            trimmed_quote.parse_flags(),
            Err(CsvError::InvalidDialect(_))
        ));

        let newline_delim = DialectOptions {
            delimiter: b'\n',
            ..Default::default()
        };
        assert!(matches!(
            newline_delim.parse_flags(),
            Err(CsvError::InvalidDialect(_))
        ));
    }

    #[test]
    fn guesses_semicolon_dialect() {
        let input = b"col1;col2;col3\n1;2;3\n4;5;6\n";
        let guess =
            DialectOptions::infer_from_sample(input, &[b',', b';', b'\t']).unwrap();
        assert_eq!(b';', guess.delimiter);
        assert_eq!(0, guess.header_row);
    }

    #[test]
    fn guesses_comma_with_default_candidates() {
        let input = b"a,b,c\n1,2,3\n4,5,6\n7,8,9\n";
        let guess =
            DialectOptions::infer_from_sample(input, DEFAULT_DELIMITER_CANDIDATES).unwrap();
        assert_eq!(b',', guess.delimiter);
        assert_eq!(0, guess.header_row);
    }

    #[test]
    fn guesses_header_past_leading_junk() {
        // The junk line drags both candidates to the same score; the larger
        // modal field count decides, and the header lands past the junk.
        let input = b"exported report, 2024\nname|score\nmario|9.5\nwario|10.0\n";
        let guess = DialectOptions::infer_from_sample(input, &[b',', b'|']).unwrap();
        assert_eq!(b'|', guess.delimiter);
        assert_eq!(1, guess.header_row);
    }

    #[test]
    fn empty_sample_fails() {
        assert!(matches!(
            DialectOptions::infer_from_sample(b"", &[b',']),
            Err(CsvError::InvalidDialect(_))
        ));
    }
}
