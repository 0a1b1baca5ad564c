//! Error taxonomy shared by all muninn crates.

use thiserror::Error;

/// Archive-level error type.
///
/// Every failure surfaced by the public API falls in exactly one of these
/// categories. Extension code (product type plug-ins, remote backends, hook
/// extensions) must report failures as [`Error::Plugin`]; anything else a
/// plug-in lets escape is wrapped into that variant at the call site.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration, or an extension that cannot be found.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid namespace definition or field reference.
    #[error("schema error: {0}")]
    Schema(String),

    /// Lex, parse, type or parameter failure in the query language.
    #[error("expression error: {0}")]
    Expression(String),

    /// Unique-constraint violation in the catalogue.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lookup by UUID, name or properties yielded nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation refused because of the product's current state.
    #[error("invalid state: {0}")]
    State(String),

    /// Storage backend I/O failure, hash mismatch or remote fetch failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Database-level failure not modelled by a more specific variant.
    #[error("backend error: {0}")]
    Backend(String),

    /// A plug-in raised, returned incompatible data, or was missing a
    /// mandatory attribute.
    #[error("plugin error: {0}")]
    Plugin(String),
}

/// Result type alias used throughout muninn.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
