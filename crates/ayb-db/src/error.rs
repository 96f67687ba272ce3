//! Typed engine errors plus the SQLSTATE classification every PostgreSQL
//! failure passes through before it reaches the HTTP envelope.

use sqlx::error::DatabaseError as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// Bad input from the caller: unknown column, malformed filter, invalid
    /// pagination, value that cannot be coerced into the column type.
    #[error("{0}")]
    Validation(String),

    /// Table, record or function the request addressed does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Unique or foreign-key violation (SQLSTATE 23505 / 23503).
    #[error("{message}")]
    Conflict {
        message: String,
        constraint: Option<String>,
        detail: Option<String>,
    },

    /// NOT NULL or CHECK violation (SQLSTATE 23502 / 23514).
    #[error("{message}")]
    Unprocessable {
        message: String,
        constraint: Option<String>,
    },

    /// Anything else bubbling out of the database driver.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn validation(message: impl Into<String>) -> Self {
        DbError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DbError::NotFound(message.into())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let sqlx::Error::Database(ref db_err) = err else {
            return DbError::Database(err);
        };

        let code = match db_err.code() {
            Some(code) => code.into_owned(),
            None => return DbError::Database(err),
        };
        let constraint = db_err.constraint().map(str::to_owned);
        let message = db_err.message().to_owned();

        match code.as_str() {
            // unique_violation
            "23505" => DbError::Conflict {
                detail: extract_detail(&message),
                message,
                constraint,
            },
            // foreign_key_violation
            "23503" => DbError::Conflict {
                detail: extract_detail(&message),
                message,
                constraint,
            },
            // not_null_violation
            "23502" => DbError::Unprocessable {
                message,
                constraint,
            },
            // check_violation
            "23514" => DbError::Unprocessable {
                message,
                constraint,
            },
            // undefined_table
            "42P01" => DbError::NotFound(message),
            // undefined_column / undefined_function
            "42703" | "42883" => DbError::Validation(message),
            // invalid_text_representation / datetime overflow: a bound value
            // could not be coerced into the column type.
            "22P02" | "22007" | "22008" | "22003" => DbError::Validation(message),
            _ => DbError::Database(err),
        }
    }
}

fn extract_detail(message: &str) -> Option<String> {
    // Postgres appends "Key (col)=(value) already exists." style details;
    // the driver only hands us the primary message, so keep it whole.
    if message.is_empty() {
        None
    } else {
        Some(message.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_constructor_keeps_message() {
        let err = DbError::validation("unknown column \"nope\"");
        assert!(matches!(err, DbError::Validation(_)));
        assert_eq!(err.to_string(), "unknown column \"nope\"");
    }

    #[test]
    fn non_database_errors_stay_opaque() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Database(_)));
    }
}
