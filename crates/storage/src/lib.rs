//! Storage backends for the muninn product archive.
//!
//! A storage backend owns the bytes of archived products behind a uniform
//! facade keyed by `(archive_path, physical_name)`. Four implementations:
//! local filesystem, S3-compatible object store, OpenStack Swift, and a
//! catalogue-only "none" backend.

pub mod backends;
pub mod hash;
pub mod traits;

pub use backends::{FilesystemBackend, NoneBackend, S3Backend, SwiftBackend};
pub use hash::{product_hash, product_size, split_hash, HashAlgorithm};
pub use traits::{StorageBackend, TempWorkspace};
