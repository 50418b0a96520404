//! Rubric documents and their derived criteria.

pub mod parser;
pub mod patterns;

pub use parser::{Criterion, RubricDocument, RubricError, RubricSchema};
