use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use procure_core::errors::{ApplicationError, DomainError};

pub mod delegation;
pub mod rule;
pub mod workflow;

pub use delegation::SqlDelegationRepository;
pub use rule::SqlRuleRepository;
pub use workflow::SqlWorkflowRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Domain(domain) => ApplicationError::Domain(domain),
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(database) if database.is_unique_violation())
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_date(column: &str, value: String) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(&value, DATE_FORMAT).map_err(|error| {
        RepositoryError::Decode(format!("invalid date in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_enum<T>(
    column: &str,
    value: String,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(&value).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{value}`")))
}

const DATE_FORMAT: &str = "%Y-%m-%d";
