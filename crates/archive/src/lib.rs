//! Archive orchestrator for the muninn product catalogue.
//!
//! An archive pairs a catalogue database with a storage backend and a
//! plug-in registry behind one handle, and implements the catalogue
//! operations: ingest, attach, pull, strip, remove, retrieve, export,
//! search, summary, tagging and linking, plus the cascade engine that
//! propagates strip/remove through link graphs.

pub mod archive;
mod cascade;
pub mod credentials;
pub mod open;
pub mod plugin;

pub use archive::{Archive, ArchiveOptions, AttachOptions, IngestOptions};
pub use credentials::{CredentialStore, Credentials};
pub use muninn_database::{SearchQuery, SummaryQuery, SummaryResult};
pub use open::{load_config, open, open_with_config, resolve_config_file, Extensions};
pub use plugin::{
    AnalyzeResult, CascadeRule, HookExtension, ProductTypePlugin, Registry, RemoteBackend,
};
