//! Parsing for the ATerm subset used as the derivation wire format:
//! constructors, tuples, lists and quoted strings.
//!
//! [`fields`] holds the nom combinators for individual quoted fields;
//! [`Parser`] drives them with an explicit, bounded-depth cursor.

mod escape;
mod fields;
mod parser;

pub use escape::escape_bytes;
pub use parser::{Error, Parser, MAX_DEPTH};
