//! Protocol types and value objects. No I/O lives here.

pub mod media;
pub mod message;
pub mod roster;
