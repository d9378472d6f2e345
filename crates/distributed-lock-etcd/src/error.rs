//! Errors reported by the coordination service.

use std::fmt;

use distributed_lock_core::error::LockError;
use thiserror::Error;

/// etcd v2 error codes the lock protocol cares about.
///
/// Unknown codes are kept verbatim in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    KeyNotFound,
    TestFailed,
    NotFile,
    NotDir,
    NodeExist,
    RootReadOnly,
    DirNotEmpty,
    Unauthorized,
    PrevValueRequired,
    TtlNotANumber,
    IndexNotANumber,
    InvalidField,
    InvalidForm,
    RaftInternal,
    LeaderElect,
    WatcherCleared,
    EventIndexCleared,
    Other(u32),
}

impl ErrorCode {
    /// Maps a numeric etcd error code.
    pub fn from_code(code: u32) -> Self {
        match code {
            100 => ErrorCode::KeyNotFound,
            101 => ErrorCode::TestFailed,
            102 => ErrorCode::NotFile,
            104 => ErrorCode::NotDir,
            105 => ErrorCode::NodeExist,
            107 => ErrorCode::RootReadOnly,
            108 => ErrorCode::DirNotEmpty,
            110 => ErrorCode::Unauthorized,
            201 => ErrorCode::PrevValueRequired,
            202 => ErrorCode::TtlNotANumber,
            203 => ErrorCode::IndexNotANumber,
            209 => ErrorCode::InvalidField,
            210 => ErrorCode::InvalidForm,
            300 => ErrorCode::RaftInternal,
            301 => ErrorCode::LeaderElect,
            400 => ErrorCode::WatcherCleared,
            401 => ErrorCode::EventIndexCleared,
            other => ErrorCode::Other(other),
        }
    }

    /// Returns the numeric etcd error code.
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::KeyNotFound => 100,
            ErrorCode::TestFailed => 101,
            ErrorCode::NotFile => 102,
            ErrorCode::NotDir => 104,
            ErrorCode::NodeExist => 105,
            ErrorCode::RootReadOnly => 107,
            ErrorCode::DirNotEmpty => 108,
            ErrorCode::Unauthorized => 110,
            ErrorCode::PrevValueRequired => 201,
            ErrorCode::TtlNotANumber => 202,
            ErrorCode::IndexNotANumber => 203,
            ErrorCode::InvalidField => 209,
            ErrorCode::InvalidForm => 210,
            ErrorCode::RaftInternal => 300,
            ErrorCode::LeaderElect => 301,
            ErrorCode::WatcherCleared => 400,
            ErrorCode::EventIndexCleared => 401,
            ErrorCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failure of a single call to the coordination service.
#[derive(Error, Debug)]
pub enum KeysError {
    /// A conditional write found the key in the wrong state.
    ///
    /// `NodeExist` is what a losing create-if-absent returns.
    #[error("precondition violated (code {0})")]
    PreconditionViolated(ErrorCode),

    /// The key does not exist.
    #[error("key not found")]
    NotFound,

    /// Any other error reported by the service.
    #[error("remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// The request never produced a service answer.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl KeysError {
    /// Classifies an error reported by the service.
    pub fn from_remote(code: ErrorCode, message: impl Into<String>) -> Self {
        match code {
            ErrorCode::KeyNotFound => KeysError::NotFound,
            ErrorCode::NodeExist | ErrorCode::TestFailed => KeysError::PreconditionViolated(code),
            code => KeysError::Remote {
                code,
                message: message.into(),
            },
        }
    }

    pub(crate) fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        KeysError::Transport(Box::new(err))
    }

    /// True when a create-if-absent lost against an existing key.
    pub fn is_node_exist(&self) -> bool {
        matches!(self, KeysError::PreconditionViolated(ErrorCode::NodeExist))
    }

    /// True when the key was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeysError::NotFound)
    }
}

impl From<KeysError> for LockError {
    fn from(err: KeysError) -> Self {
        LockError::Coordination(Box::new(err))
    }
}

/// Result type for coordination-service calls.
pub type KeysResult<T> = Result<T, KeysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip_known_values() {
        for code in [100, 101, 105, 110, 300, 401] {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
        assert_eq!(ErrorCode::from_code(999), ErrorCode::Other(999));
    }

    #[test]
    fn test_remote_errors_are_classified() {
        assert!(KeysError::from_remote(ErrorCode::NodeExist, "Key already exists").is_node_exist());
        assert!(KeysError::from_remote(ErrorCode::KeyNotFound, "Key not found").is_not_found());
        assert!(matches!(
            KeysError::from_remote(ErrorCode::TestFailed, "Compare failed"),
            KeysError::PreconditionViolated(ErrorCode::TestFailed)
        ));
        match KeysError::from_remote(ErrorCode::EventIndexCleared, "The event in requested index is outdated") {
            KeysError::Remote { code, message } => {
                assert_eq!(code, ErrorCode::EventIndexCleared);
                assert!(message.contains("outdated"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_lock_error_keeps_keys_error_as_source() {
        let err: LockError = KeysError::NotFound.into();
        let source = err.coordination_source().unwrap();
        let keys_err = source.downcast_ref::<KeysError>().unwrap();
        assert!(keys_err.is_not_found());
    }
}
