//! Chain module - The chain engine and its event sink

mod engine;
mod events;

pub use engine::*;
pub use events::*;
