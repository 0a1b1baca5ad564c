//! Core domain types for the muninn product catalogue.
//!
//! This crate defines the model shared by every other crate:
//! - the nine catalogue value types and WGS84 geometry with WKT support
//! - namespace schemas and the fixed core namespace
//! - the nested namespaced property container
//! - the expression language (lexer, parser, semantic analysis)
//! - the error taxonomy and the configuration model

pub mod config;
pub mod error;
pub mod expr;
pub mod geometry;
pub mod properties;
pub mod schema;
pub mod value;

pub use error::{Error, Result};
pub use geometry::Geometry;
pub use properties::{Properties, PropertyMap};
pub use schema::{core_namespace, FieldDef, NamespaceDef, SchemaRegistry};
pub use value::{format_timestamp, parse_timestamp, DataType, Value};
