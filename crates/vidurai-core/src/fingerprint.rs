//! Fingerprinter - Near-duplicate detection
//!
//! A stable 64-bit hash over the normalized payload. Two events that
//! differ only in incidental detail (line numbers, counts, absolute path
//! prefixes, whitespace, case) produce the same fingerprint, which is
//! what lets the aggregator collapse a 50-event error burst into one row.

use std::path::Path;

/// FNV-1a 64-bit offset basis
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Non-cryptographic 64-bit FNV-1a. Stability across releases matters
/// more than collision resistance here; fingerprints are persisted.
/// Also used by the archiver's batch checksums.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Normalize free text for fingerprinting:
/// - lowercase
/// - strip the project root prefix from absolute paths
/// - mask runs of digits with `#`
/// - collapse whitespace runs to a single space
pub fn normalize(text: &str, project_root: Option<&Path>) -> String {
    let mut text = text.to_lowercase();

    if let Some(root) = project_root {
        let root = root.to_string_lossy().to_lowercase();
        if !root.is_empty() {
            text = text.replace(&root, "");
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut in_digits = false;
    let mut in_space = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
            in_space = false;
        } else if c.is_whitespace() {
            if !in_space && !out.is_empty() {
                out.push(' ');
                in_space = true;
            }
            in_digits = false;
        } else {
            out.push(c);
            in_digits = false;
            in_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Fingerprint of a (verbatim, kind, file) triple.
pub fn fingerprint(
    verbatim: &str,
    kind: &str,
    file_path: Option<&str>,
    project_root: Option<&Path>,
) -> u64 {
    let normalized = normalize(verbatim, project_root);
    let file = file_path
        .map(|f| normalize(f, project_root))
        .unwrap_or_default();
    let mut input = String::with_capacity(normalized.len() + kind.len() + file.len() + 2);
    input.push_str(&normalized);
    input.push('\x1f');
    input.push_str(kind);
    input.push('\x1f');
    input.push_str(&file);
    fnv1a(input.as_bytes())
}

/// Hex form used in the `memories.fingerprint` column
pub fn to_hex(fp: u64) -> String {
    format!("{:016x}", fp)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_masks_numbers_and_whitespace() {
        assert_eq!(
            normalize("Error  at line 42,   col 7", None),
            "error at line #, col #"
        );
    }

    #[test]
    fn test_normalize_strips_project_root() {
        let root = PathBuf::from("/home/dev/proj");
        assert_eq!(
            normalize("/home/dev/proj/src/auth.ts failed", Some(&root)),
            "/src/auth.ts failed"
        );
    }

    #[test]
    fn test_identical_bursts_collide() {
        let root = PathBuf::from("/home/dev/proj");
        let a = fingerprint(
            "error: TS2304: Cannot find name 'Claude' (src/auth.ts:42)",
            "diagnostic",
            Some("src/auth.ts"),
            Some(&root),
        );
        let b = fingerprint(
            "error: TS2304: Cannot find name 'Claude' (src/auth.ts:43)",
            "diagnostic",
            Some("src/auth.ts"),
            Some(&root),
        );
        // Line numbers are masked, so these aggregate
        assert_eq!(a, b);
    }

    #[test]
    fn test_kind_separates_fingerprints() {
        let a = fingerprint("npm test failed", "terminal", None, None);
        let b = fingerprint("npm test failed", "diagnostic", None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_separates_fingerprints() {
        let a = fingerprint("cannot find name", "diagnostic", Some("a.ts"), None);
        let b = fingerprint("cannot find name", "diagnostic", Some("b.ts"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        // Persisted values must never change between runs
        let fp = fingerprint("$ cargo build (exit 0)", "terminal", None, None);
        assert_eq!(fp, fingerprint("$ cargo build (exit 0)", "terminal", None, None));
        assert_eq!(to_hex(fp).len(), 16);
    }
}
