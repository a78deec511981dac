//! Session identifier generation.
//!
//! Ids are KSUIDs: a 32-bit timestamp followed by 128 random bits, rendered
//! as a fixed-width 27-character base-62 string. Lexicographic order follows
//! creation time.

use svix_ksuid::{Ksuid, KsuidLike};

/// Length of every encoded id.
pub const ENCODED_LEN: usize = 27;

/// Generate a new, unique session id.
pub fn generate() -> String {
    Ksuid::new(None, None).to_base62()
}
