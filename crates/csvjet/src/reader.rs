//! Pull-based reading over a byte source.
//!
//! `CsvReader` wires a [`ByteSource`] to the decoder: it resolves the dialect
//! (guessing against a stream prefix when asked), consumes the header row,
//! and hands out rows one pull at a time or whole sealed arenas.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::decoder::{
    CsvDecoder, DiagnosticKind, Diagnostics, RowArena, DEFAULT_DIAGNOSTICS_CAP,
};
use crate::dialect::{DialectOptions, DEFAULT_DELIMITER_CANDIDATES, GUESS_SAMPLE_BYTES};
use crate::errors::{CsvError, Result};
use crate::row::{ColumnIndex, Row};
use crate::source::ByteSource;

/// Arena byte threshold beyond which the reader seals or recycles.
pub const DEFAULT_ARENA_SEAL_BYTES: usize = 1024 * 1024;

/// Delimiter selection: a fixed byte, or a candidate list that triggers
/// guessing against a stream prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delimiter {
    Byte(u8),
    Guess(Vec<u8>),
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter::Byte(b',')
    }
}

impl Delimiter {
    /// Guess among the default candidate set.
    pub fn guess_default() -> Self {
        Delimiter::Guess(DEFAULT_DELIMITER_CANDIDATES.to_vec())
    }
}

/// Reader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvOptions {
    pub delimiter: Delimiter,
    pub quote: u8,
    /// Bytes trimmed from the edges of unquoted fields. Empty disables
    /// trimming.
    pub trim: Vec<u8>,
    /// Index of the header row. `None` reads everything as data.
    pub header_row: Option<usize>,
    /// Explicit column names; overrides `header_row`.
    pub column_names: Option<Vec<String>>,
    /// Escalate leniency violations to `InvalidCsv`.
    pub strict: bool,
    /// Strip a UTF-8 BOM at the start of the stream.
    pub detect_bom: bool,
    /// Arena byte threshold for sealing/recycling.
    pub arena_seal_bytes: usize,
    /// Cap on buffered diagnostics.
    pub diagnostics_cap: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        CsvOptions {
            delimiter: Delimiter::default(),
            quote: b'"',
            trim: Vec::new(),
            header_row: Some(0),
            column_names: None,
            strict: false,
            detect_bom: true,
            arena_seal_bytes: DEFAULT_ARENA_SEAL_BYTES,
            diagnostics_cap: DEFAULT_DIAGNOSTICS_CAP,
        }
    }
}

impl CsvOptions {
    pub(crate) fn dialect_with(&self, delimiter: u8) -> DialectOptions {
        DialectOptions {
            delimiter,
            quote: self.quote,
            trim: self.trim.clone(),
            strict: self.strict,
            detect_bom: self.detect_bom,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum HeaderState {
    /// Waiting for the header row to be decoded.
    Pending { row: usize },
    Done,
}

/// Tracks header consumption for the sync and async readers.
#[derive(Debug)]
pub(crate) struct HeaderTracker {
    state: HeaderState,
}

impl HeaderTracker {
    pub fn new(
        options: &CsvOptions,
        guessed_header: Option<usize>,
        decoder: &mut CsvDecoder,
        arena: &mut RowArena,
    ) -> Self {
        if let Some(names) = &options.column_names {
            decoder.set_expected_fields(names.len());
            arena.set_column_index(Arc::new(ColumnIndex::from_names(names.clone())));
            return HeaderTracker {
                state: HeaderState::Done,
            };
        }

        // A guessed header index replaces the default position only; explicit
        // "no header" stands.
        let header_row = match (guessed_header, options.header_row) {
            (Some(guessed), Some(0)) => Some(guessed),
            (_, configured) => configured,
        };

        match header_row {
            Some(row) => {
                decoder.disable_expected_tracking();
                HeaderTracker {
                    state: HeaderState::Pending { row },
                }
            }
            None => HeaderTracker {
                state: HeaderState::Done,
            },
        }
    }

    pub fn ready(&self) -> bool {
        matches!(self.state, HeaderState::Done)
    }

    /// Consume the header once it has been decoded. Returns true when the
    /// arena changed (rows ahead of the header and the header itself are
    /// dropped; data rows decoded in the same chunk are kept).
    pub fn observe(&mut self, arena: &mut RowArena, decoder: &mut CsvDecoder) -> Result<bool> {
        let row = match self.state {
            HeaderState::Pending { row } => row,
            HeaderState::Done => return Ok(false),
        };
        if arena.num_rows() <= row {
            return Ok(false);
        }
        let names = arena.row(row).to_vec()?;
        debug!(columns = names.len(), "parsed csv header");
        let expected = names.len();
        decoder.set_expected_fields(expected);
        arena.set_column_index(Arc::new(ColumnIndex::from_names(names)));
        arena.drop_first_rows(row + 1);
        self.state = HeaderState::Done;

        // Data rows decoded in the same chunk as the header were emitted
        // before the expectation existed; check their lengths now.
        for idx in 0..arena.num_rows() {
            let (got, end_offset) = {
                let row_view = arena.row(idx);
                (row_view.len(), row_view.end_offset())
            };
            if got == expected {
                continue;
            }
            if decoder.is_strict() {
                return Err(CsvError::InvalidCsv {
                    offset: end_offset,
                    reason: format!("expected {expected} fields, got {got}"),
                });
            }
            let ordinal = (row + 1 + idx) as u64;
            decoder.record_diagnostic(
                ordinal,
                end_offset,
                DiagnosticKind::UnequalRowLength { expected, got },
            );
        }

        Ok(true)
    }
}

/// Synchronous pull-based CSV reader.
#[derive(Debug)]
pub struct CsvReader<S> {
    source: S,
    decoder: CsvDecoder,
    arena: RowArena,
    dialect: DialectOptions,
    header: HeaderTracker,
    /// Prefix chunks consumed during dialect guessing, replayed before the
    /// source is pulled again.
    pending: VecDeque<Bytes>,
    arena_seal_bytes: usize,
    /// Next row in the current arena to hand out.
    cursor: usize,
    rows_read: u64,
    done: bool,
}

impl<S: ByteSource> CsvReader<S> {
    pub fn new(mut source: S, options: CsvOptions) -> Result<Self> {
        let mut pending = VecDeque::new();
        let (dialect, guessed_header) = match &options.delimiter {
            Delimiter::Byte(delimiter) => (options.dialect_with(*delimiter), None),
            Delimiter::Guess(candidates) => {
                let mut total = 0;
                while total < GUESS_SAMPLE_BYTES {
                    match source.read_chunk()? {
                        Some(chunk) => {
                            total += chunk.len();
                            pending.push_back(chunk);
                        }
                        None => break,
                    }
                }
                let sample: Vec<u8> = pending.iter().flat_map(|c| c.iter().copied()).collect();
                let guess = DialectOptions::infer_from_sample(&sample, candidates)?;
                (
                    options.dialect_with(guess.delimiter),
                    Some(guess.header_row),
                )
            }
        };

        let mut decoder = CsvDecoder::with_diagnostics_cap(&dialect, options.diagnostics_cap)?;
        let mut arena = RowArena::new(dialect.quote);
        let header = HeaderTracker::new(&options, guessed_header, &mut decoder, &mut arena);

        Ok(CsvReader {
            source,
            decoder,
            arena,
            dialect,
            header,
            pending,
            arena_seal_bytes: options.arena_seal_bytes,
            cursor: 0,
            rows_read: 0,
            done: false,
        })
    }

    /// Pull the next row.
    ///
    /// The returned view borrows the reader and must be dropped before the
    /// next pull; use [`CsvReader::next_arena`] to take ownership of rows in
    /// bulk instead.
    pub fn next_row(&mut self) -> Result<Option<Row<'_>>> {
        loop {
            if self.header.observe(&mut self.arena, &mut self.decoder)? {
                self.cursor = 0;
            }
            if self.header.ready() && self.cursor < self.arena.num_rows() {
                let idx = self.cursor;
                self.cursor += 1;
                self.rows_read += 1;
                return Ok(Some(self.arena.row(idx)));
            }
            if self.done {
                return Ok(None);
            }
            self.pump()?;
        }
    }

    /// Decode until the current arena reaches the seal threshold (or the
    /// stream ends) and hand it over, column index included. Returns `None`
    /// once the stream is exhausted and drained.
    pub fn next_arena(&mut self) -> Result<Option<RowArena>> {
        loop {
            if self.header.observe(&mut self.arena, &mut self.decoder)? {
                self.cursor = 0;
            }
            if self.header.ready() && self.arena.bytes_len() >= self.arena_seal_bytes {
                return Ok(Some(self.seal()));
            }
            if self.done {
                if self.header.ready() && self.arena.num_rows() > 0 {
                    return Ok(Some(self.seal()));
                }
                return Ok(None);
            }
            self.pump()?;
        }
    }

    /// Column names from the header or explicit configuration.
    pub fn column_names(&self) -> Option<&[String]> {
        self.arena.column_index().map(|index| index.names())
    }

    pub fn column_index(&self) -> Option<&Arc<ColumnIndex>> {
        self.arena.column_index()
    }

    /// The resolved dialect, after any guessing.
    pub fn dialect(&self) -> &DialectOptions {
        &self.dialect
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.decoder.diagnostics()
    }

    pub fn take_diagnostics(&mut self) -> Diagnostics {
        self.decoder.take_diagnostics()
    }

    /// Number of data rows handed out so far.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// True if a UTF-8 BOM was stripped from the stream.
    pub fn utf8_bom(&self) -> bool {
        self.decoder.utf8_bom()
    }

    fn pump(&mut self) -> Result<()> {
        // Recycle the arena once consumers have drained it past the
        // threshold. The decoder holds any partial row, so the arena is
        // always complete-rows-only.
        if self.header.ready()
            && self.cursor == self.arena.num_rows()
            && self.arena.bytes_len() >= self.arena_seal_bytes
        {
            trace!(bytes = self.arena.bytes_len(), "recycling row arena");
            self.arena.clear_rows();
            self.cursor = 0;
        }

        let chunk = match self.pending.pop_front() {
            Some(chunk) => Some(chunk),
            None => self.source.read_chunk()?,
        };
        match chunk {
            Some(chunk) => {
                self.decoder.decode(&chunk, &mut self.arena)?;
            }
            None => {
                self.decoder.finish(&mut self.arena)?;
                self.done = true;
            }
        }
        Ok(())
    }

    fn seal(&mut self) -> RowArena {
        let mut fresh = RowArena::new(self.dialect.quote);
        if let Some(index) = self.arena.column_index() {
            fresh.set_column_index(index.clone());
        }
        trace!(
            rows = self.arena.num_rows(),
            bytes = self.arena.bytes_len(),
            "sealing row arena"
        );
        self.cursor = 0;
        std::mem::replace(&mut self.arena, fresh)
    }
}
