//! Error types for minictl

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    // === Consensus Errors ===
    /// No leader is elected, quorum was lost, or leadership changed while a
    /// request was in flight.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Not leader: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotLeader(Option<String>),

    /// The request did not observe commitment in time. It may still apply.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    // === State Machine Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("No workers registered")]
    NoWorkers,

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// A retry must reuse the same natural key so that a command which did
    /// apply despite the error is absorbed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unavailable(_)
            | Error::NotLeader(_)
            | Error::DeadlineExceeded(_)
            | Error::ConnectionFailed(_) => true,
            Error::Grpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
            ),
            _ => false,
        }
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::NotLeader(leader) => {
                let mut status = tonic::Status::new(Code::FailedPrecondition, self.to_string());
                let value = leader
                    .as_deref()
                    .and_then(|l| l.parse::<tonic::metadata::AsciiMetadataValue>().ok());
                if let Some(value) = value {
                    status.metadata_mut().insert("leader", value);
                }
                status
            }
            Error::Unavailable(_) | Error::ConnectionFailed(_) => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::DeadlineExceeded(_) => {
                tonic::Status::new(Code::DeadlineExceeded, self.to_string())
            }
            Error::Conflict(_) => tonic::Status::new(Code::AlreadyExists, self.to_string()),
            Error::InvalidCommand(_) | Error::InvalidConfig(_) => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::NoWorkers => tonic::Status::new(Code::FailedPrecondition, self.to_string()),
            // Statuses relayed from the leader pass through untouched.
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        e.to_grpc_status()
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
