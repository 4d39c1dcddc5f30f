use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Primary key, unique or foreign key violation raised by a write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("invalid hex value {value:?}: expected {expected} bytes")]
    InvalidHex { value: String, expected: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported database driver: {0}")]
    UnsupportedDriver(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.clone().unwrap_or_else(|| code.to_string()))
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl StoreError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}
