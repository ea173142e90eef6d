//! Content fingerprints for change detection
//!
//! Fingerprinting is best-effort dirty checking: it only notices changes that
//! are visible in the watched keys at poll time.

/// Digest over the contents of a set of local keys
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, entries: &[(String, Option<String>)]) -> String;
}

/// BLAKE3 over `key \0 value \0` for every entry, in order
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Fingerprint;

impl Fingerprinter for Blake3Fingerprint {
    fn fingerprint(&self, entries: &[(String, Option<String>)]) -> String {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in entries {
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            match value {
                Some(value) => {
                    hasher.update(&[1]);
                    hasher.update(value.as_bytes());
                }
                None => {
                    hasher.update(&[2]);
                }
            }
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(value: Option<&str>) -> Vec<(String, Option<String>)> {
        vec![("records".to_string(), value.map(str::to_string))]
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let fp = Blake3Fingerprint;
        assert_eq!(fp.fingerprint(&entries(Some("[]"))), fp.fingerprint(&entries(Some("[]"))));
        assert_ne!(fp.fingerprint(&entries(Some("[]"))), fp.fingerprint(&entries(Some("[1]"))));
        assert_ne!(fp.fingerprint(&entries(None)), fp.fingerprint(&entries(Some(""))));
    }
}
