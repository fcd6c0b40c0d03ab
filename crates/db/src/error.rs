use mender_core::{Fault, FaultKind};
use sqlx::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("no open transaction for `{0}`")]
    NoOpenTransaction(String),
    #[error("rollback of `{table}` matched no row")]
    RowMissing { table: String },
    #[error("{write} rollback of `{table}` has no usable original row")]
    IncompleteImage { table: String, write: &'static str },
}

impl RepositoryError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Database(sqlx::Error::Database(db)) => match db.kind() {
                ErrorKind::Other => FaultKind::Runtime,
                _ => FaultKind::Constraint,
            },
            Self::Database(sqlx::Error::PoolTimedOut) => FaultKind::Timeout,
            Self::Database(sqlx::Error::Io(_) | sqlx::Error::PoolClosed) => FaultKind::Connection,
            Self::Database(sqlx::Error::RowNotFound) | Self::RowMissing { .. } => {
                FaultKind::NotFound
            }
            Self::Database(_) => FaultKind::Runtime,
            Self::Decode(_) => FaultKind::TypeMismatch,
            Self::InvalidIdentifier(_) | Self::IncompleteImage { .. } => FaultKind::Validation,
            Self::NoOpenTransaction(_) => FaultKind::Coordination,
        }
    }
}

impl From<RepositoryError> for Fault {
    fn from(error: RepositoryError) -> Self {
        Fault::from_error(error.fault_kind(), error)
    }
}

#[cfg(test)]
mod tests {
    use mender_core::{Fault, FaultKind};

    use super::RepositoryError;

    #[test]
    fn repository_errors_map_onto_fault_kinds() {
        let timeout: Fault = RepositoryError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(timeout.kind, FaultKind::Timeout);

        let identifier: Fault = RepositoryError::InvalidIdentifier("a;b".to_owned()).into();
        assert_eq!(identifier.kind, FaultKind::Validation);
        assert!(identifier.message.contains("a;b"));

        let missing: Fault = RepositoryError::RowMissing { table: "plans".to_owned() }.into();
        assert_eq!(missing.kind, FaultKind::NotFound);
    }
}
