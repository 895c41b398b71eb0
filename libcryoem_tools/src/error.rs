use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum StarError {
    #[error("StarFile failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not open StarFile because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Malformed field declaration on line {line}: {text}")]
    BadFieldDeclaration { line: usize, text: String },
    #[error("Field {name} has index #{index}; indices must be unique and run from 1 to {count}")]
    BadFieldIndex {
        name: String,
        index: usize,
        count: usize,
    },
    #[error("Row {row} of the data table has {found} values but the header declares {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("Line {0} is not inside a data block")]
    OutsideBlock(usize),
    #[error("Data row on line {0} does not follow a loop_ header")]
    RowOutsideTable(usize),
    #[error("Could not determine the STAR data type; expected data_particles, data_micrographs or data_movies")]
    UnknownDataType,
    #[error("STAR file does not contain a data table")]
    NoDataTable,
    #[error("STAR table has no field named {0}")]
    MissingField(String),
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Transform failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Transform failed due to StarFile error: {0}")]
    StarError(#[from] StarError),
    #[error("Transform failed due to file search error: {0}")]
    TargetError(#[from] TargetError),
    #[error("File {0:?} is not a .star, .cbox or .box file")]
    UnsupportedExtension(PathBuf),
    #[error("Value {value} on line {line} of a BOX file is not a number")]
    NotNumeric { line: usize, value: String },
    #[error("Random range is empty: {0} is not below {1}")]
    EmptyRange(f64, f64),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Filter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Filter failed due to StarFile error: {0}")]
    StarError(#[from] StarError),
    #[error("Filter was given no reference files")]
    NoReferences,
    #[error("Reference files mix particles and micrographs: {0:?}")]
    MixedReferenceTypes(Vec<PathBuf>),
    #[error("A {table} table cannot be filtered by particle references")]
    IncompatibleReferences { table: String },
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("File search failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Directory {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("No input files ending with {suffix} found in {dir:?}")]
    NoInputFiles { dir: PathBuf, suffix: String },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Executable {0} was not found; check that it is installed and on PATH")]
    NotFound(String),
    #[error("File {0:?} exists but is not executable")]
    NotExecutable(PathBuf),
    #[error("Could not start {program:?}: {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program:?} exited with status {code:?}: {}", .stderr.trim())]
    Failed {
        program: PathBuf,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("External tool failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MdocError {
    #[error("Mdoc failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Malformed ZValue section header on line {line}: {text}")]
    BadZValue { line: usize, text: String },
}

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("Wrapper failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Wrapper failed due to external tool error: {0}")]
    ToolError(#[from] ToolError),
    #[error("Wrapper failed due to file search error: {0}")]
    TargetError(#[from] TargetError),
    #[error("Wrapper failed due to mdoc error: {0}")]
    MdocError(#[from] MdocError),
    #[error("Option {option} is invalid: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
    #[error("Angle file {0:?} was not found")]
    MissingAngFile(PathBuf),
}

#[derive(Debug, Error)]
pub enum CtffindResultError {
    #[error("CTFFIND results failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Header line {line} should start with '{expected}'")]
    BadHeaderLine { line: usize, expected: &'static str },
    #[error("Header line {line} has no value for {field}")]
    MissingHeaderValue { line: usize, field: &'static str },
    #[error("File {0:?} ended before the five header lines were read")]
    TruncatedHeader(PathBuf),
    #[error("Value {value} on line {line} is not a number")]
    BadNumber { line: usize, value: String },
    #[error("Line {line} has {found} values but the header declares {expected} columns")]
    RowWidth {
        line: usize,
        found: usize,
        expected: usize,
    },
    #[error("Results table has no column for {0}")]
    MissingColumn(&'static str),
    #[error("Rotational average file has {found} trailing lines; each micrograph needs {expected}")]
    TruncatedAvrot { found: usize, expected: usize },
}

#[derive(Debug, Error)]
pub enum FscError {
    #[error("FSC reader failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("File {0:?} is not a recognised FSC export (.xml, .dat, .txt or .csv)")]
    UnsupportedFormat(PathBuf),
    #[error("Value {value} on line {line} is not a number")]
    BadNumber { line: usize, value: String },
    #[error("Line {line} has {found} columns; expected {expected}")]
    RowWidth {
        line: usize,
        found: usize,
        expected: usize,
    },
    #[error("No FSC values were found in {0:?}")]
    Empty(PathBuf),
    #[error("Curve {name} has {frequencies} frequencies but {values} values")]
    LengthMismatch {
        name: String,
        frequencies: usize,
        values: usize,
    },
    #[error("Pixel size must be positive, got {0}")]
    BadPixelSize(f64),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid e-mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("Could not build e-mail message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP transport failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitor failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Monitor failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Monitor failed due to notifier error: {0}")]
    NotifyError(#[from] NotifyError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config value {field} is invalid: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to wrapper error: {0}")]
    WrapperError(#[from] WrapperError),
    #[error("Processor failed due to external tool error: {0}")]
    ToolError(#[from] ToolError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}
