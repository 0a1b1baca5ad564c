//! The catalogue expression language.
//!
//! An expression goes through three stages: the [`lexer`] produces typed
//! tokens, the [`parser`] builds an untyped syntax tree, and [`analyze`]
//! resolves names against the live schema and types every node. The typed
//! tree is target-agnostic; lowering to SQL is the database backend's job.

pub mod analyze;
pub mod ident;
pub mod lexer;
pub mod parser;

pub use analyze::{
    parse_and_analyze, parse_and_analyze_having, AnalyzedExpr, Analyzer, ExprType, FunctionTable,
    ParameterValue, Parameters, Prototype, TypedExpr,
};
pub use ident::SummaryIdentifier;
pub use parser::{parse, Expr};
