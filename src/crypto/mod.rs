//! Cryptographic primitives used by the tunnel
//!
//! Thin wrappers over the RustCrypto implementations of BLAKE2s,
//! ChaCha20-Poly1305, XChaCha20-Poly1305 and X25519, plus the Noise
//! chaining-key/hash state machine built on top of them.

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;
