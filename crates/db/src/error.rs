//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),

    #[error("row not found")]
    NotFound,

    /// A unique or primary-key constraint rejected the write.
    #[error("duplicate row violates constraint '{0}'")]
    Duplicate(String),

    /// A foreign key points at a row that does not exist (any more).
    #[error("referenced row is missing for constraint '{0}'")]
    MissingReference(String),

    /// A delete was refused because other rows still reference the target.
    #[error("row is still referenced by {0} other row(s)")]
    InUse(i64),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(db.constraint().unwrap_or("unknown").to_owned())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Self::MissingReference(db.constraint().unwrap_or("unknown").to_owned())
            }
            other => Self::Sqlx(other),
        }
    }
}
