//! Storage backend implementations.

pub mod fs;
pub mod none;
mod objects;
pub mod s3;
pub mod swift;

pub use fs::FilesystemBackend;
pub use none::NoneBackend;
pub use s3::S3Backend;
pub use swift::SwiftBackend;
