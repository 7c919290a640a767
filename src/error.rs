use std::path::PathBuf;

/// Custom Result type for bkc operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the bkc library, encompassing all error cases
/// that can occur while counting barcoded k-mers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid parameter values or incompatible option combinations
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Malformed input records or auxiliary files
    #[error("Input error: {0}")]
    InputError(#[from] InputError),

    /// Errors raised by the shared read store
    #[error("Read store error: {0}")]
    StoreError(#[from] StoreError),

    /// Errors raised while writing or reading shard files
    #[error("Output error: {0}")]
    OutputError(#[from] OutputError),

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Errors from the paraseq FASTX readers
    #[error("FASTX error: {0}")]
    FastxError(String),
}

/// Errors detected while validating parameters, before any processing starts
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Incorrect value for {name}: {value} (allowed range: {min}..={max})")]
    ValueOutOfRange {
        name: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },

    #[error("Canonical k-mers are only available in single counting mode")]
    CanonicalInPairMode,

    #[error("CBC correction requires a predefined CBC list")]
    CorrectionWithoutAllowList,

    #[error("The splash output format is not supported; use bkc")]
    UnsupportedOutputFormat,

    #[error("Input list contains no file pairs")]
    EmptyInputList,

    #[error("Filtered input export requested without --filtered_input_path")]
    MissingFilteredInputPath,
}

/// Errors raised by malformed input data
#[derive(thiserror::Error, Debug)]
pub enum InputError {
    /// A line of the input-name file does not contain a comma-separated pair
    #[error("Wrong line in input name file: {0}")]
    MalformedInputLine(String),

    /// The CBC+UMI read length is outside the acceptable window
    #[error(
        "CBC+UMI read of length {len} outside acceptable range [{min}, {max}] \
         (use --allow_strange_cbc_umi_reads to skip such reads)"
    )]
    StrangeCbcUmiLength { len: usize, min: usize, max: usize },

    /// An anchor string does not have the configured leader length
    #[error("Wrong anchor length: {0}")]
    WrongAnchorLength(String),

    /// An anchor string contains a symbol outside {{A,C,G,T}}
    #[error("Anchor contains strange symbols: {0}")]
    InvalidAnchorSymbol(String),

    /// A line of the Visium allow-list does not match the expected format
    #[error("Unknown trusted CBC description: {0}")]
    MalformedVisiumLine(String),

    /// A predefined CBC does not have the configured CBC length
    #[error("Predefined CBC of wrong length: {0}")]
    WrongPredefinedCbcLength(String),

    /// A predefined CBC contains a symbol outside {{A,C,G,T}}
    #[error("Predefined CBC contains strange symbols: {0}")]
    InvalidPredefinedCbcSymbol(String),

    /// An auxiliary file could not be opened
    #[error("Cannot open: {0}")]
    CannotOpen(PathBuf),
}

/// Errors raised by the shared read store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A read exceeds the 16-bit length prefix of the 3-bit codec
    #[error("Read of length {0} exceeds the maximum storable length ({max})", max = u16::MAX)]
    ReadTooLong(usize),

    /// A read handle references a file arena that does not exist
    #[error("Read handle references unknown file index {0}")]
    UnknownFile(usize),

    /// A read handle references bytes outside its file arena
    #[error("Read handle out of bounds: segment {segment}, offset {offset}")]
    HandleOutOfBounds { segment: usize, offset: usize },
}

/// Errors raised while writing or decoding shard files
#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    /// The magic number at the start of a shard does not match
    #[error("Invalid shard file magic")]
    InvalidMagic,

    /// The format version of a shard is not supported
    #[error("Unsupported shard format version: {0}")]
    UnsupportedVersion(u8),

    /// A block extends past the end of the shard file
    #[error("Truncated block at byte position {0}")]
    TruncatedBlock(usize),

    /// A delta-packed record references a prefix longer than the record
    #[error("Corrupt delta stream: prefix length {prefix} exceeds record size {record_size}")]
    CorruptDeltaStream { prefix: usize, record_size: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValueOutOfRange {
            name: "leader_len",
            value: 64,
            min: 1,
            max: 32,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("leader_len"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn test_error_from_input_error() {
        let err: Error = InputError::WrongAnchorLength("ACGTT".to_string()).into();
        assert!(matches!(err, Error::InputError(_)));
    }

    #[test]
    fn test_strange_length_display() {
        let err = InputError::StrangeCbcUmiLength {
            len: 10,
            min: 28,
            max: 30,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("10"));
        assert!(msg.contains("28"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn test_store_error_read_too_long() {
        let err = StoreError::ReadTooLong(100_000);
        let msg = format!("{}", err);
        assert!(msg.contains("100000"));
        assert!(msg.contains("65535"));
    }
}
