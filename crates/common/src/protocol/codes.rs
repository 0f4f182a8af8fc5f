use std::fmt;

use crate::bus::ServiceError;

/// Stable error codes sent in the out-of-band error header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidMessage,
    InvalidAction,
    EngineRun,
    RepositoryGetFile,
    WorkerNotFound,
    WorkerStarting,
    InvalidResponse,
    NewResponseFailed,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::InvalidMessage,
        ErrorCode::InvalidAction,
        ErrorCode::EngineRun,
        ErrorCode::RepositoryGetFile,
        ErrorCode::WorkerNotFound,
        ErrorCode::WorkerStarting,
        ErrorCode::InvalidResponse,
        ErrorCode::NewResponseFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "400001",
            ErrorCode::InvalidAction => "400002",
            ErrorCode::EngineRun => "400008",
            ErrorCode::RepositoryGetFile => "400010",
            ErrorCode::WorkerNotFound => "400011",
            ErrorCode::WorkerStarting => "400012",
            ErrorCode::InvalidResponse => "500001",
            ErrorCode::NewResponseFailed => "500002",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "invalid message",
            ErrorCode::InvalidAction => "invalid action",
            ErrorCode::EngineRun => "engine run failed",
            ErrorCode::RepositoryGetFile => "failed to get file from repository",
            ErrorCode::WorkerNotFound => "worker not found",
            ErrorCode::WorkerStarting => "worker is starting",
            ErrorCode::InvalidResponse => "invalid response",
            ErrorCode::NewResponseFailed => "failed to build response",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Error with the default description.
    pub fn error(self) -> RpcError {
        RpcError {
            code: self,
            description: self.description().to_string(),
        }
    }

    /// Error carrying `detail` after the default description.
    pub fn with_detail(self, detail: impl fmt::Display) -> RpcError {
        RpcError {
            code: self,
            description: format!("{}: {detail}", self.description()),
        }
    }

    pub fn matches(self, err: &ServiceError) -> bool {
        err.code == self.as_str()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed RPC failure, sent out of band as a [`ServiceError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub description: String,
}

impl RpcError {
    /// Recover a typed error; `None` for codes outside the protocol.
    pub fn from_service(err: &ServiceError) -> Option<Self> {
        Some(Self {
            code: ErrorCode::parse(&err.code)?,
            description: err.description.clone(),
        })
    }
}

impl From<RpcError> for ServiceError {
    fn from(err: RpcError) -> Self {
        ServiceError::new(err.code.as_str(), err.description)
    }
}
