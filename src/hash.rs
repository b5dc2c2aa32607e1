//! MD5 as a capability, not a global.
//!
//! The original tool loaded MD5 from a dynamically-linked system crypto
//! library at runtime (a workaround for a restricted Android build). That
//! indirection is pointless in Rust: we depend directly on the `md-5` crate
//! and expose exactly the `new`/`update`/`finalize` surface the rest of the
//! crate needs, so the capability boundary from the design notes still
//! exists as a type, just without the `dlopen`.

use md5::{Digest, Md5};

/// A running MD5 computation.
#[derive(Default)]
pub struct Md5Hasher(Md5);

impl Md5Hasher {
    /// Starts a new MD5 computation.
    pub fn new() -> Self {
        Self(Md5::new())
    }

    /// Feeds more bytes into the running digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Consumes the hasher, returning the 16-byte digest.
    pub fn finalize(self) -> [u8; 16] {
        self.0.finalize().into()
    }
}
