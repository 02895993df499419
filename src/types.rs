//! Shared primitive types

/// 32-byte BLAKE3 digest used for object, segment and bucket hashes
pub type Hash = [u8; 32];

/// Key bytes as stored in a hash tree segment
pub type TreeKey = Vec<u8>;
