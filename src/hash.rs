//! xxHash-based composite-key fingerprinting.
//!
//! Storage maps (§4.3, §4.4) stay string/tuple-keyed `BTreeMap`s because
//! storage must be key-ordered — hashing is not order-preserving. This
//! module instead provides a deterministic, collision-resistant
//! `fingerprint()` used for debug/tracing identifiers over primary keys and
//! join correlation tuples, so log lines can name a row without printing
//! every column.

use xxhash_rust::xxh64::xxh64;

const SEED: u64 = 0x517c_c1b7_2722_0a95;

/// Compute a 64-bit fingerprint from a sequence of optional text values.
///
/// Each value is separated by an ASCII record separator (`\x1E`) and a
/// `None` is encoded with a marker distinct from the literal string
/// `"NULL"`, so `[None]` and `[Some("NULL")]` never collide.
pub fn fingerprint<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> u64 {
    let mut combined = String::new();
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            combined.push('\x1E');
        }
        match value {
            Some(val) => combined.push_str(val),
            None => combined.push_str("\x00NULL\x00"),
        }
    }
    xxh64(combined.as_bytes(), SEED)
}

/// Fingerprint a single string (convenience wrapper over [`fingerprint`]).
pub fn fingerprint_one(value: &str) -> u64 {
    xxh64(value.as_bytes(), SEED)
}
