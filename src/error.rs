// Error types for construction, stepping and serialization.

use thiserror::Error;

/// Failure while decoding a serialized hierarchy (or one of its modules).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SerializeError {
    /// The buffer does not start with the hierarchy magic number.
    #[error("bad magic number: got {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    /// The buffer was written by an incompatible format version.
    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// The buffer ended before a value could be read.
    #[error("buffer truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The buffer decoded but describes an impossible structure.
    #[error("corrupt buffer: {0}")]
    Corrupt(String),

    /// A state-only buffer does not fit the hierarchy it is applied to.
    #[error("state buffer does not match hierarchy structure: {0}")]
    StructureMismatch(String),
}

/// Engine error taxonomy. Every variant is returned before any state is
/// mutated.
#[derive(Error, Debug)]
pub enum SphError {
    /// Invalid descriptor or configuration at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wrong number of input CSDRs passed to `step`.
    #[error("incorrect number of input CSDRs: expected {expected}, got {got}")]
    InputCount { expected: usize, got: usize },

    /// An input CSDR has the wrong number of columns.
    #[error("CSDR for IO port {io} has {got} columns, expected {expected}")]
    ShapeMismatch { io: usize, expected: usize, got: usize },

    /// An input CSDR contains a cell index outside `[0, column_size)`.
    #[error("CSDR for IO port {io} has out-of-range cell index {value} at column {column} (column size {column_size})")]
    InvalidCsdr {
        io: usize,
        column: usize,
        value: i32,
        column_size: i32,
    },

    /// Runtime parameters were resized or hold invalid values.
    #[error("invalid parameters: {0}")]
    Params(String),

    /// Reward vector has the wrong length or a non-finite entry.
    #[error("invalid reward: {0}")]
    Reward(String),

    /// Layer or IO index outside the configured range.
    #[error("{kind} index {index} out of range (count {count})")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    /// The IO port exists but has no module of the requested kind.
    #[error("IO port {io} is {actual:?}, operation requires {required}")]
    WrongIoType {
        io: usize,
        actual: crate::config::IoType,
        required: &'static str,
    },

    /// Buffer decoding failed; the hierarchy was left untouched.
    #[error(transparent)]
    Serialization(#[from] SerializeError),

    /// JSON descriptor parsing failed.
    #[error("JSON descriptor error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system error during save/load.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dedicated worker pool could not be built.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_error_converts_and_displays() {
        let err: SphError = SerializeError::Truncated {
            needed: 4,
            remaining: 1,
        }
        .into();
        assert!(matches!(
            err,
            SphError::Serialization(SerializeError::Truncated { .. })
        ));
        assert_eq!(
            err.to_string(),
            "buffer truncated: needed 4 more bytes, 1 remaining"
        );
    }

    #[test]
    fn invalid_csdr_message_names_port_and_column() {
        let err = SphError::InvalidCsdr {
            io: 1,
            column: 3,
            value: 40,
            column_size: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("IO port 1"));
        assert!(msg.contains("column 3"));
    }
}
