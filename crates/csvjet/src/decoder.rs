//! CSV byte state machine and arena-backed row storage.
//!
//! The decoder consumes arbitrarily sliced byte chunks and emits completed
//! rows into a [`RowArena`]. The in-progress row is buffered inside the
//! decoder itself, so an arena only ever holds complete rows and can be
//! sealed at any decode boundary.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::dialect::{DialectOptions, ParseFlagTable, ParseFlags};
use crate::errors::{CsvError, Result};
use crate::row::{ColumnIndex, Row};

/// Default cap on buffered diagnostics.
pub const DEFAULT_DIAGNOSTICS_CAP: usize = 1024;

/// Locates one field's content within the arena's byte store.
///
/// The descriptor references bytes, never owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField {
    /// Offset of the content in the byte store.
    pub start: usize,
    /// Content length in bytes, escapes included.
    pub len: usize,
    /// True when the content contains at least one quote byte. Such fields
    /// materialize through the escape cache on access.
    pub has_double_quote: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RowMeta {
    pub data_start: usize,
    pub data_len: usize,
    pub fields_start: usize,
    pub field_count: usize,
    /// Absolute input offset of the row's terminator. Diagnostics anchor.
    pub end_offset: u64,
}

/// Lazily materialized unescaped payloads for fields with embedded quotes.
///
/// Keyed by field-descriptor index, separate from the descriptors themselves
/// so the descriptor stays small and the clean-field path stays branch-free.
#[derive(Debug, Default)]
struct EscapeCache {
    entries: RefCell<HashMap<usize, Box<str>>>,
}

impl EscapeCache {
    fn get_or_try_insert<F>(&self, key: usize, init: F) -> Result<&str>
    where
        F: FnOnce() -> Result<String>,
    {
        let mut entries = self.entries.borrow_mut();
        let entry = match entries.entry(key) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(init()?.into_boxed_str()),
        };
        let ptr: *const str = entry.as_ref();
        // SAFETY: entries are append-only and boxed; the allocation behind
        // `ptr` is never moved or dropped while `self` is alive.
        Ok(unsafe { &*ptr })
    }

    fn clear(&mut self) {
        self.entries.get_mut().clear();
    }
}

/// Append-only storage for a contiguous run of parsed rows.
///
/// Raw row bytes, field descriptors, and row descriptors live in three
/// parallel stores. Once handed out by the reader an arena is read-only and
/// may back any number of [`Row`] views.
#[derive(Debug)]
pub struct RowArena {
    quote: u8,
    bytes: Vec<u8>,
    fields: Vec<RawField>,
    rows: Vec<RowMeta>,
    escape_cache: EscapeCache,
    column_index: Option<Arc<ColumnIndex>>,
}

impl Default for RowArena {
    fn default() -> Self {
        RowArena::new(b'"')
    }
}

impl RowArena {
    pub fn new(quote: u8) -> Self {
        RowArena {
            quote,
            bytes: Vec::new(),
            fields: Vec::new(),
            rows: Vec::new(),
            escape_cache: EscapeCache::default(),
            column_index: None,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Bytes currently held by the byte store. Drives seal decisions.
    pub fn bytes_len(&self) -> usize {
        self.bytes.len()
    }

    /// Get a view over a row.
    ///
    /// Panics if `idx` is out of range.
    pub fn row(&self, idx: usize) -> Row<'_> {
        assert!(idx < self.rows.len(), "row index out of range");
        Row::new(self, idx)
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.num_rows()).map(|idx| self.row(idx))
    }

    pub fn column_index(&self) -> Option<&Arc<ColumnIndex>> {
        self.column_index.as_ref()
    }

    pub fn set_column_index(&mut self, index: Arc<ColumnIndex>) {
        self.column_index = Some(index);
    }

    /// Drop all rows while keeping the quote byte and column index. Used by
    /// the reader to recycle a drained arena.
    pub fn clear_rows(&mut self) {
        self.bytes.clear();
        self.fields.clear();
        self.rows.clear();
        self.escape_cache.clear();
    }

    pub(crate) fn row_meta(&self, idx: usize) -> &RowMeta {
        &self.rows[idx]
    }

    pub(crate) fn row_bytes(&self, idx: usize) -> &[u8] {
        let meta = &self.rows[idx];
        &self.bytes[meta.data_start..meta.data_start + meta.data_len]
    }

    /// Raw field descriptor by absolute descriptor index.
    pub fn raw_field(&self, idx: usize) -> &RawField {
        &self.fields[idx]
    }

    pub(crate) fn field_bytes(&self, idx: usize) -> &[u8] {
        let field = &self.fields[idx];
        &self.bytes[field.start..field.start + field.len]
    }

    /// Field content as text, materializing the unescape on first access for
    /// fields with embedded quotes.
    pub(crate) fn field_text(&self, idx: usize) -> Result<&str> {
        let field = self.fields[idx];
        let raw = &self.bytes[field.start..field.start + field.len];
        if !field.has_double_quote {
            return std::str::from_utf8(raw)
                .map_err(|_| CsvError::InvalidUtf8 { offset: field.start });
        }
        let quote = self.quote;
        self.escape_cache.get_or_try_insert(idx, || {
            String::from_utf8(collapse_quotes(raw, quote))
                .map_err(|_| CsvError::InvalidUtf8 { offset: field.start })
        })
    }

    /// Append a completed row. Field starts are relative to `row_bytes` and
    /// are rebased into the shared byte store.
    pub(crate) fn push_row(&mut self, row_bytes: &[u8], fields: &[RawField], end_offset: u64) {
        let data_start = self.bytes.len();
        let fields_start = self.fields.len();
        self.bytes.extend_from_slice(row_bytes);
        self.fields.extend(fields.iter().map(|f| RawField {
            start: f.start + data_start,
            ..*f
        }));
        self.rows.push(RowMeta {
            data_start,
            data_len: row_bytes.len(),
            fields_start,
            field_count: fields.len(),
            end_offset,
        });
    }

    /// Drop the first `n` rows, shifting the remainder to the front of the
    /// stores. Used when the header (and anything ahead of it) has been
    /// consumed out of a freshly decoded arena.
    pub(crate) fn drop_first_rows(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n >= self.rows.len() {
            self.clear_rows();
            return;
        }

        let first_kept = self.rows[n];
        let byte_off = first_kept.data_start;
        let field_off = first_kept.fields_start;

        self.bytes.copy_within(byte_off.., 0);
        self.bytes.truncate(self.bytes.len() - byte_off);

        self.fields.copy_within(field_off.., 0);
        self.fields.truncate(self.fields.len() - field_off);
        for field in &mut self.fields {
            field.start -= byte_off;
        }

        self.rows.copy_within(n.., 0);
        self.rows.truncate(self.rows.len() - n);
        for row in &mut self.rows {
            row.data_start -= byte_off;
            row.fields_start -= field_off;
        }

        // Cache keys are absolute descriptor indices, all of which shifted.
        self.escape_cache.clear();
    }
}

/// Collapse doubled quote bytes into one. Lone quotes pass through.
fn collapse_quotes(raw: &[u8], quote: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        out.push(raw[i]);
        if raw[i] == quote && i + 1 < raw.len() && raw[i + 1] == quote {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

/// Soft parse anomaly kinds reported in lenient mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Row field count differs from the expected count.
    UnequalRowLength { expected: usize, got: usize },
    /// Quote byte inside an unquoted field, or content continuing after a
    /// closing quote.
    UnescapedQuote,
    /// Input ended inside a quoted field; the partial field was emitted.
    UnexpectedEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    /// Ordinal of the row the anomaly is attached to.
    pub row: u64,
    /// Absolute byte offset in the input stream.
    pub offset: u64,
    pub kind: DiagnosticKind,
}

/// Bounded ring of diagnostics. Oldest entries are dropped once the cap is
/// reached so pathological inputs stay memory-bounded.
#[derive(Debug)]
pub struct Diagnostics {
    entries: VecDeque<Diagnostic>,
    cap: usize,
    dropped: u64,
}

impl Diagnostics {
    pub(crate) fn with_cap(cap: usize) -> Self {
        Diagnostics {
            entries: VecDeque::new(),
            cap,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, diagnostic: Diagnostic) {
        if self.cap == 0 {
            self.dropped += 1;
            return;
        }
        if self.entries.len() == self.cap {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(diagnostic);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of diagnostics evicted to stay under the cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Result of feeding a chunk to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderResult {
    /// Input was exhausted mid-row; feed more bytes or call `finish`.
    NeedsMore,
    /// Input was exhausted exactly on a row boundary.
    RowBoundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// At a column boundary, nothing consumed for the next field yet.
    FieldStart,
    /// Reading an unquoted field body.
    InUnquoted,
    /// Reading inside a quoted field body.
    InQuoted,
    /// Just saw a quote while quoted; the next byte disambiguates a closing
    /// quote from an escaped pair.
    QuoteInQuoted,
}

#[derive(Debug, Clone, Copy)]
enum BomScan {
    Pending { buf: [u8; 3], len: u8 },
    Done,
}

/// Streaming CSV state machine.
pub struct CsvDecoder {
    flags: ParseFlagTable,
    strict: bool,

    state: ParseState,
    bom: BomScan,
    utf8_bom: bool,
    /// A row was just closed by `\r`; an immediately following `\n` belongs
    /// to the same terminator.
    swallow_lf: bool,
    /// Absolute byte offset in the input stream.
    offset: u64,

    /// Raw bytes of the in-progress row, terminator excluded.
    row_buf: Vec<u8>,
    /// Completed field descriptors of the in-progress row, starts relative to
    /// `row_buf`.
    row_fields: Vec<RawField>,
    /// Start of the current field's content in `row_buf`. None until the
    /// field has content.
    field_start: Option<usize>,
    field_has_quote: bool,
    /// Trailing trim-eligible bytes appended since the last content byte.
    pending_ws: usize,
    /// Whitespace bytes appended since a potential closing quote.
    ws_since_close: usize,

    expected_fields: Option<usize>,
    /// Adopt the first emitted row's field count as the expectation.
    track_expected: bool,
    rows_emitted: u64,
    diagnostics: Diagnostics,
}

impl CsvDecoder {
    pub fn new(dialect: &DialectOptions) -> Result<Self> {
        Self::with_diagnostics_cap(dialect, DEFAULT_DIAGNOSTICS_CAP)
    }

    pub fn with_diagnostics_cap(dialect: &DialectOptions, cap: usize) -> Result<Self> {
        let flags = dialect.parse_flags()?;
        Ok(CsvDecoder {
            flags,
            strict: dialect.strict,
            state: ParseState::FieldStart,
            bom: if dialect.detect_bom {
                BomScan::Pending {
                    buf: [0; 3],
                    len: 0,
                }
            } else {
                BomScan::Done
            },
            utf8_bom: false,
            swallow_lf: false,
            offset: 0,
            row_buf: Vec::new(),
            row_fields: Vec::new(),
            field_start: None,
            field_has_quote: false,
            pending_ws: 0,
            ws_since_close: 0,
            expected_fields: None,
            track_expected: true,
            rows_emitted: 0,
            diagnostics: Diagnostics::with_cap(cap),
        })
    }

    /// Decode a chunk, emitting completed rows into `arena`.
    ///
    /// Chunks may slice the input at any byte; partial state is retained
    /// across calls. [`CsvDecoder::finish`] must be called once after the
    /// final chunk.
    pub fn decode(&mut self, input: &[u8], arena: &mut RowArena) -> Result<DecoderResult> {
        let mut i = 0;

        // The first three bytes of the stream may arrive split across chunks,
        // so the BOM scan buffers them.
        while let BomScan::Pending { buf, len } = &mut self.bom {
            if i >= input.len() {
                return Ok(self.result());
            }
            buf[*len as usize] = input[i];
            *len += 1;
            i += 1;
            if *len == 3 {
                let buf = *buf;
                self.bom = BomScan::Done;
                if buf == [0xEF, 0xBB, 0xBF] {
                    self.utf8_bom = true;
                    self.offset += 3;
                } else {
                    for b in buf {
                        self.process_byte(b, arena)?;
                    }
                }
            }
        }

        while i < input.len() {
            let b = input[i];

            // Inside a field body, scan ahead over the run of non-special
            // bytes in one pass.
            if matches!(self.state, ParseState::InUnquoted | ParseState::InQuoted)
                && self.flags.get(b) == ParseFlags::NotSpecial
            {
                let start = i;
                let mut end = i + 1;
                while end < input.len() && self.flags.get(input[end]) == ParseFlags::NotSpecial {
                    end += 1;
                }
                self.row_buf.extend_from_slice(&input[start..end]);
                self.pending_ws = 0;
                self.offset += (end - start) as u64;
                i = end;
                continue;
            }

            self.process_byte(b, arena)?;
            i += 1;
        }

        Ok(self.result())
    }

    /// Flush the in-progress row after the final chunk.
    pub fn finish(&mut self, arena: &mut RowArena) -> Result<()> {
        // A stream shorter than three bytes never resolved the BOM scan.
        if let BomScan::Pending { buf, len } = self.bom {
            self.bom = BomScan::Done;
            for b in &buf[0..len as usize] {
                self.process_byte(*b, arena)?;
            }
        }

        match self.state {
            ParseState::FieldStart => {
                if !self.row_fields.is_empty() || !self.row_buf.is_empty() {
                    self.end_field(None);
                    self.close_row(arena, 0)?;
                }
            }
            ParseState::InUnquoted => {
                self.end_field(None);
                self.close_row(arena, 0)?;
            }
            ParseState::QuoteInQuoted => {
                let end = self.quoted_end();
                self.end_field(Some(end));
                self.close_row(arena, 0)?;
            }
            ParseState::InQuoted => {
                if self.strict {
                    return Err(CsvError::UnexpectedEof {
                        offset: self.offset,
                    });
                }
                self.push_diag(DiagnosticKind::UnexpectedEof);
                self.end_field(None);
                self.close_row(arena, 0)?;
            }
        }
        Ok(())
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Diagnostics {
        let cap = self.diagnostics.cap;
        std::mem::replace(&mut self.diagnostics, Diagnostics::with_cap(cap))
    }

    /// True if a UTF-8 BOM was stripped from the start of the stream.
    pub fn utf8_bom(&self) -> bool {
        self.utf8_bom
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    pub fn byte_offset(&self) -> u64 {
        self.offset
    }

    /// Fix the per-row field count used for ragged-row checks.
    pub fn set_expected_fields(&mut self, expected: usize) {
        self.expected_fields = Some(expected);
    }

    /// Stop adopting the first row's field count as the expectation. Used
    /// while rows ahead of the header are being consumed.
    pub(crate) fn disable_expected_tracking(&mut self) {
        self.track_expected = false;
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.strict
    }

    /// Record a diagnostic for a row checked after emission, e.g. a data row
    /// decoded in the same chunk as the header.
    pub(crate) fn record_diagnostic(&mut self, row: u64, offset: u64, kind: DiagnosticKind) {
        self.diagnostics.push(Diagnostic { row, offset, kind });
    }

    fn process_byte(&mut self, b: u8, arena: &mut RowArena) -> Result<()> {
        if self.swallow_lf {
            self.swallow_lf = false;
            if b == b'\n' {
                self.offset += 1;
                return Ok(());
            }
        }

        let flag = self.flags.get(b);
        match self.state {
            ParseState::FieldStart => match flag {
                ParseFlags::Delimiter => {
                    self.end_field(None);
                    self.row_buf.push(b);
                }
                ParseFlags::Quote => {
                    self.row_buf.push(b);
                    self.field_start = Some(self.row_buf.len());
                    self.state = ParseState::InQuoted;
                }
                ParseFlags::Newline => {
                    self.end_field(None);
                    self.close_row(arena, b)?;
                }
                ParseFlags::PossibleWhitespace => {
                    self.row_buf.push(b);
                }
                ParseFlags::NotSpecial => {
                    self.field_start = Some(self.row_buf.len());
                    self.row_buf.push(b);
                    self.state = ParseState::InUnquoted;
                }
            },
            ParseState::InUnquoted => match flag {
                ParseFlags::Delimiter => {
                    self.end_field(None);
                    self.row_buf.push(b);
                    self.state = ParseState::FieldStart;
                }
                ParseFlags::Quote => {
                    if self.strict {
                        return Err(CsvError::InvalidCsv {
                            offset: self.offset,
                            reason: "quote inside unquoted field".to_string(),
                        });
                    }
                    self.push_diag(DiagnosticKind::UnescapedQuote);
                    self.field_has_quote = true;
                    self.row_buf.push(b);
                    self.pending_ws = 0;
                }
                ParseFlags::Newline => {
                    self.end_field(None);
                    self.close_row(arena, b)?;
                }
                ParseFlags::PossibleWhitespace => {
                    self.row_buf.push(b);
                    self.pending_ws += 1;
                }
                ParseFlags::NotSpecial => {
                    self.row_buf.push(b);
                    self.pending_ws = 0;
                }
            },
            ParseState::InQuoted => match flag {
                ParseFlags::Quote => {
                    self.row_buf.push(b);
                    self.ws_since_close = 0;
                    self.state = ParseState::QuoteInQuoted;
                }
                // Delimiters, newlines, and whitespace are literal inside a
                // quoted field.
                _ => {
                    self.row_buf.push(b);
                }
            },
            ParseState::QuoteInQuoted => match flag {
                ParseFlags::Quote if self.ws_since_close == 0 => {
                    // Escaped pair. The raw pair stays in the buffer and is
                    // collapsed on materialization.
                    self.row_buf.push(b);
                    self.field_has_quote = true;
                    self.state = ParseState::InQuoted;
                }
                ParseFlags::Delimiter => {
                    let end = self.quoted_end();
                    self.end_field(Some(end));
                    self.row_buf.push(b);
                    self.state = ParseState::FieldStart;
                }
                ParseFlags::Newline => {
                    let end = self.quoted_end();
                    self.end_field(Some(end));
                    self.close_row(arena, b)?;
                }
                ParseFlags::PossibleWhitespace => {
                    self.row_buf.push(b);
                    self.ws_since_close += 1;
                }
                _ => {
                    // Content continuing after a closing quote.
                    if self.strict {
                        return Err(CsvError::InvalidCsv {
                            offset: self.offset,
                            reason: "unexpected byte after closing quote".to_string(),
                        });
                    }
                    self.push_diag(DiagnosticKind::UnescapedQuote);
                    self.field_has_quote = true;
                    self.row_buf.push(b);
                    self.pending_ws = 0;
                    self.state = ParseState::InUnquoted;
                }
            },
        }

        self.offset += 1;
        Ok(())
    }

    /// Content end of a field closed by a quote, excluding the closing quote
    /// and any whitespace seen after it.
    fn quoted_end(&self) -> usize {
        self.row_buf.len() - 1 - self.ws_since_close
    }

    fn end_field(&mut self, quoted_end: Option<usize>) {
        let (start, end) = match self.field_start {
            Some(start) => {
                let end = quoted_end.unwrap_or(self.row_buf.len() - self.pending_ws);
                (start, end)
            }
            None => {
                let at = self.row_buf.len();
                (at, at)
            }
        };
        self.row_fields.push(RawField {
            start,
            len: end - start,
            has_double_quote: self.field_has_quote,
        });
        self.field_start = None;
        self.field_has_quote = false;
        self.pending_ws = 0;
        self.ws_since_close = 0;
    }

    fn close_row(&mut self, arena: &mut RowArena, terminator: u8) -> Result<()> {
        if terminator == b'\r' {
            self.swallow_lf = true;
        }

        let field_count = self.row_fields.len();
        arena.push_row(&self.row_buf, &self.row_fields, self.offset);
        self.row_buf.clear();
        self.row_fields.clear();
        self.state = ParseState::FieldStart;

        match self.expected_fields {
            Some(expected) if expected != field_count => {
                if self.strict {
                    return Err(CsvError::InvalidCsv {
                        offset: self.offset,
                        reason: format!("expected {expected} fields, got {field_count}"),
                    });
                }
                self.push_diag(DiagnosticKind::UnequalRowLength {
                    expected,
                    got: field_count,
                });
            }
            None if self.track_expected => self.expected_fields = Some(field_count),
            _ => (),
        }

        self.rows_emitted += 1;
        Ok(())
    }

    fn push_diag(&mut self, kind: DiagnosticKind) {
        self.diagnostics.push(Diagnostic {
            row: self.rows_emitted,
            offset: self.offset,
            kind,
        });
    }

    fn result(&self) -> DecoderResult {
        let mid_bom = matches!(self.bom, BomScan::Pending { len, .. } if len > 0);
        if !mid_bom
            && self.state == ParseState::FieldStart
            && self.row_fields.is_empty()
            && self.row_buf.is_empty()
        {
            DecoderResult::RowBoundary
        } else {
            DecoderResult::NeedsMore
        }
    }
}

impl std::fmt::Debug for CsvDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvDecoder")
            .field("state", &self.state)
            .field("offset", &self.offset)
            .field("rows_emitted", &self.rows_emitted)
            .finish_non_exhaustive()
    }
}
