use std::fmt;
use std::io::Error as IoError;

/// Fatal error taxonomy. There is no local recovery: any of these aborts the
/// run, surfacing contig, chunk index and coordinates where applicable.
#[derive(Debug)]
pub enum PolishError {
    /// Missing or unreadable alignment, reference, parameter file, or
    /// alignment index. Fatal at startup.
    InputUnavailable(String),
    /// A contig referenced by the alignment is absent from the FASTA, or
    /// chunk coordinates exceed the contig length.
    InputMismatch(String),
    /// The parameter document is unparseable or internally inconsistent.
    ParameterInconsistent(String),
    /// No chunk yielded any reads.
    EmptyCoverage(String),
    /// Unrecoverable error inside a worker.
    ChunkFailure {
        contig: String,
        chunk_index: usize,
        start: usize,
        end: usize,
        message: String,
    },
}

impl PolishError {
    /// Attach chunk context to a worker-side failure message.
    pub fn chunk_failure(
        contig: &str,
        chunk_index: usize,
        start: usize,
        end: usize,
        message: impl fmt::Display,
    ) -> Self {
        PolishError::ChunkFailure {
            contig: contig.to_string(),
            chunk_index,
            start,
            end,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for PolishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolishError::InputUnavailable(msg) => write!(f, "input unavailable: {}", msg),
            PolishError::InputMismatch(msg) => write!(f, "input mismatch: {}", msg),
            PolishError::ParameterInconsistent(msg) => {
                write!(f, "inconsistent parameters: {}", msg)
            }
            PolishError::EmptyCoverage(msg) => write!(f, "empty coverage: {}", msg),
            PolishError::ChunkFailure {
                contig,
                chunk_index,
                start,
                end,
                message,
            } => write!(
                f,
                "chunk {} ({}:{}-{}) failed: {}",
                chunk_index, contig, start, end, message
            ),
        }
    }
}

impl std::error::Error for PolishError {}

impl From<IoError> for PolishError {
    fn from(e: IoError) -> Self {
        PolishError::InputUnavailable(e.to_string())
    }
}

impl From<rust_htslib::errors::Error> for PolishError {
    fn from(e: rust_htslib::errors::Error) -> Self {
        PolishError::InputUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for PolishError {
    fn from(e: serde_json::Error) -> Self {
        PolishError::ParameterInconsistent(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PolishError>;
