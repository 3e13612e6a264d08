pub type Result<T, E = CsvError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    /// The dialect options cannot produce an unambiguous parse table.
    ///
    /// Raised at reader construction, never mid-stream.
    #[error("invalid dialect: {0}")]
    InvalidDialect(String),

    /// Strict-mode parse failure. Terminates the stream.
    #[error("invalid csv at byte {offset}: {reason}")]
    InvalidCsv { offset: u64, reason: String },

    #[error("field index {index} out of range for row of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("cannot interpret {value:?} as {target}")]
    TypeCoercionFailed {
        value: String,
        target: &'static str,
    },

    /// Byte source ended inside a quoted field.
    #[error("unexpected eof at byte {offset}")]
    UnexpectedEof { offset: u64 },

    #[error("invalid utf-8 in field starting at arena byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error(transparent)]
    Read(#[from] std::io::Error),
}
