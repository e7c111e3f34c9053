//! Content-addressed LoRA names
//!
//! Uploaded LoRAs are stored remotely as `<sha256>_<suffix>` and locally as
//! just `<sha256>`.

/// Hex length of a SHA-256 digest
pub const CONTENT_HASH_LEN: usize = 64;

/// The 64-hex-digit content hash a name refers to, if any.
///
/// Any leading path (up to the last `/`) is ignored and the remainder is
/// split at its first `_` or `-`. `.ckpt` names are never content-addressed.
pub fn content_hash(name: &str) -> Option<&str> {
    if name.is_empty() || name.ends_with(".ckpt") {
        return None;
    }

    let base = name.rsplit('/').next().unwrap_or(name);
    let head = match base.find(|c: char| c == '_' || c == '-') {
        Some(pos) => &base[..pos],
        None => base,
    };

    if head.len() == CONTENT_HASH_LEN && head.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(head)
    } else {
        None
    }
}

/// Whether a name refers to content by hash
pub fn is_content_addressed(name: &str) -> bool {
    content_hash(name).is_some()
}

/// Local file name for a reference; non-content-addressed names pass through
pub fn canonical_name(name: &str) -> &str {
    content_hash(name).unwrap_or(name)
}
