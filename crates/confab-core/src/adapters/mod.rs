//! Infrastructure adapters: wire codec, crypto, and networking.

pub mod codec;
pub mod crypto;
pub mod net;
