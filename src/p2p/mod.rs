//! P2P networking module - Wire messages, framing, peer state, and IBD

mod framing;
mod ibd;
mod message;
mod peer;

pub use framing::*;
pub use ibd::*;
pub use message::*;
pub use peer::*;
