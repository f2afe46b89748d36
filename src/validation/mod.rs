//! Validation module - Transaction structures and canonical ids

mod transaction;

pub use transaction::*;
