//! Async reading over a chunk stream.
//!
//! Mirrors the synchronous reader for callers that source bytes from an async
//! stream. The state machine itself never suspends mid-byte; the only await
//! points are chunk boundaries.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::decoder::{CsvDecoder, Diagnostics, RowArena};
use crate::dialect::{DialectOptions, GuessResult, GUESS_SAMPLE_BYTES};
use crate::errors::{CsvError, Result};
use crate::reader::{CsvOptions, Delimiter, HeaderTracker};

/// Buffer a prefix of the stream, guess the dialect against it, and return
/// the buffered chunks so no bytes are lost.
///
/// Feed the returned chunks back through [`AsyncCsvReader::with_prefix`].
pub async fn infer_from_stream(
    stream: &mut BoxStream<'static, Result<Bytes>>,
    candidates: &[u8],
) -> Result<(GuessResult, Vec<Bytes>)> {
    let mut prefix = Vec::new();
    let mut total = 0;
    while total < GUESS_SAMPLE_BYTES {
        match stream.next().await {
            Some(chunk) => {
                let chunk = chunk?;
                total += chunk.len();
                prefix.push(chunk);
            }
            None => break,
        }
    }
    let sample: Vec<u8> = prefix.iter().flat_map(|c| c.iter().copied()).collect();
    let guess = DialectOptions::infer_from_sample(&sample, candidates)?;
    Ok((guess, prefix))
}

/// Async pull-based CSV reader yielding sealed arenas.
pub struct AsyncCsvReader {
    stream: BoxStream<'static, Result<Bytes>>,
    decoder: CsvDecoder,
    arena: RowArena,
    dialect: DialectOptions,
    header: HeaderTracker,
    pending: VecDeque<Bytes>,
    arena_seal_bytes: usize,
    done: bool,
}

impl AsyncCsvReader {
    /// Build a reader over a stream with a fully resolved dialect.
    ///
    /// Delimiter guessing needs the prefix round-trip of
    /// [`infer_from_stream`]; a `Delimiter::Guess` here is rejected.
    pub fn new(stream: BoxStream<'static, Result<Bytes>>, options: CsvOptions) -> Result<Self> {
        Self::with_prefix(Vec::new(), stream, options)
    }

    /// Build a reader that replays `prefix` chunks before pulling from the
    /// stream.
    pub fn with_prefix(
        prefix: Vec<Bytes>,
        stream: BoxStream<'static, Result<Bytes>>,
        options: CsvOptions,
    ) -> Result<Self> {
        let delimiter = match &options.delimiter {
            Delimiter::Byte(delimiter) => *delimiter,
            Delimiter::Guess(_) => {
                return Err(CsvError::InvalidDialect(
                    "delimiter guessing over a stream goes through infer_from_stream".to_string(),
                ));
            }
        };
        let dialect = options.dialect_with(delimiter);
        let mut decoder = CsvDecoder::with_diagnostics_cap(&dialect, options.diagnostics_cap)?;
        let mut arena = RowArena::new(dialect.quote);
        let header = HeaderTracker::new(&options, None, &mut decoder, &mut arena);

        Ok(AsyncCsvReader {
            stream,
            decoder,
            arena,
            dialect,
            header,
            pending: prefix.into(),
            arena_seal_bytes: options.arena_seal_bytes,
            done: false,
        })
    }

    /// Decode until the current arena reaches the seal threshold (or the
    /// stream ends) and hand it over. `None` once the stream is exhausted and
    /// drained.
    pub async fn next_arena(&mut self) -> Result<Option<RowArena>> {
        loop {
            self.header.observe(&mut self.arena, &mut self.decoder)?;
            if self.header.ready() && self.arena.bytes_len() >= self.arena_seal_bytes {
                return Ok(Some(self.seal()));
            }
            if self.done {
                if self.header.ready() && self.arena.num_rows() > 0 {
                    return Ok(Some(self.seal()));
                }
                return Ok(None);
            }

            let chunk = match self.pending.pop_front() {
                Some(chunk) => Some(chunk),
                None => self.stream.next().await.transpose()?,
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
        }
    }

    pub fn dialect(&self) -> &DialectOptions {
        &self.dialect
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.decoder.diagnostics()
    }

    pub fn utf8_bom(&self) -> bool {
        self.decoder.utf8_bom()
    }

    fn seal(&mut self) -> RowArena {
        let mut fresh = RowArena::new(self.dialect.quote);
        if let Some(index) = self.arena.column_index() {
            fresh.set_column_index(index.clone());
        }
        std::mem::replace(&mut self.arena, fresh)
    }
}

impl fmt::Debug for AsyncCsvReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCsvReader").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::stream;

    use super::*;

    fn chunk_stream(chunks: Vec<&'static [u8]>) -> BoxStream<'static, Result<Bytes>> {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    fn collect_rows(arenas: &[RowArena]) -> Vec<Vec<String>> {
        arenas
            .iter()
            .flat_map(|arena| arena.rows().map(|row| row.to_vec().unwrap()))
            .collect()
    }

    #[test]
    fn reads_chunked_stream() {
        block_on(async {
            let stream = chunk_stream(vec![
                &b"name,score\nmar"[..],
                &b"io,9.5\nwario,10.0\n"[..],
            ]);
            let mut reader = AsyncCsvReader::new(stream, CsvOptions::default()).unwrap();

            let mut arenas = Vec::new();
            while let Some(arena) = reader.next_arena().await.unwrap() {
                arenas.push(arena);
            }

            assert_eq!(
                vec![vec!["mario", "9.5"], vec!["wario", "10.0"]],
                collect_rows(&arenas)
            );
            assert_eq!(
                "9.5",
                arenas[0]
                    .row(0)
                    .get_by_name("score")
                    .unwrap()
                    .raw_view()
                    .unwrap()
            );
        });
    }

    #[test]
    fn infers_dialect_then_reads_with_prefix() {
        block_on(async {
            let mut stream = chunk_stream(vec![&b"col1;col2\n1;2\n3;4\n"[..]]);
            let (guess, prefix) = infer_from_stream(&mut stream, &[b',', b';']).await.unwrap();
            assert_eq!(b';', guess.delimiter);

            let options = CsvOptions {
                delimiter: Delimiter::Byte(guess.delimiter),
                header_row: Some(guess.header_row),
                ..Default::default()
            };
            let mut reader = AsyncCsvReader::with_prefix(prefix, stream, options).unwrap();

            let mut arenas = Vec::new();
            while let Some(arena) = reader.next_arena().await.unwrap() {
                arenas.push(arena);
            }
            assert_eq!(vec![vec!["1", "2"], vec!["3", "4"]], collect_rows(&arenas));
        });
    }

    #[test]
    fn guess_delimiter_rejected_without_prefix() {
        let stream = chunk_stream(vec![&b"a,b\n"[..]]);
        let options = CsvOptions {
            delimiter: Delimiter::guess_default(),
            ..Default::default()
        };
        assert!(matches!(
            AsyncCsvReader::new(stream, options),
            Err(CsvError::InvalidDialect(_))
        ));
    }

    #[test]
    fn seals_at_threshold() {
        block_on(async {
            let stream = chunk_stream(vec![&b"a,b\n1,2\n3,4\n5,6\n"[..]]);
            let options = CsvOptions {
                arena_seal_bytes: 1,
                ..Default::default()
            };
            let mut reader = AsyncCsvReader::new(stream, options).unwrap();

            let mut arenas = Vec::new();
            while let Some(arena) = reader.next_arena().await.unwrap() {
                arenas.push(arena);
            }
            // Everything decoded in one chunk seals into a single arena here.
            assert_eq!(
                vec![vec!["1", "2"], vec!["3", "4"], vec!["5", "6"]],
                collect_rows(&arenas)
            );
        });
    }
}
