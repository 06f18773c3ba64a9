//! Integer type legalization
//!
//! Rewrites SSA functions so that integer arithmetic, compares, lane
//! indices and memory accesses only use the widths a platform supports.
//! Narrow values are promoted to a wider legal type, values wider than the
//! ALU are split into parts, and illegal loads and stores are broken into
//! supported chunks.

pub mod config;
pub mod error;
pub mod ir;
pub mod legalize;
pub mod lexer;
pub mod parser;
pub mod span;

pub use error::{CompileError, Result};
pub use span::Span;
