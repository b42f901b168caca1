use thiserror::Error;

/// Named failure conditions a caller may want to tell apart.
///
/// Library functions return `anyhow::Result`; these variants travel inside
/// the `anyhow::Error` and can be recovered with `downcast_ref`.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("token identifier {0} not recognised")]
    UnknownIdentifier(String),
    #[error("no price history cached for {0}")]
    MissingHistory(String),
    #[error("malformed {kind} file {path}: {reason}")]
    Malformed {
        kind: &'static str,
        path: String,
        reason: String,
    },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("block time index has no entries")]
    EmptyIndex,
}
