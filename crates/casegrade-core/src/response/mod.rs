//! Parsing and validating model responses.

pub mod extract;
pub mod validator;

pub use extract::{classify_unparseable, find_json_object};
pub use validator::{parse_and_validate, ResponseParseError, ResponseValidator, ScoredEvaluation};
