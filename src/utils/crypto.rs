use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time comparison of two device fingerprints.
pub fn device_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Stable device fingerprint: hex SHA-256 over the joined components,
/// truncated to 32 characters and prefixed with `fp-`.
pub fn fingerprint<I, S>(components: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for (i, part) in components.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_ref().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("fp-{}", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_comparison() {
        assert!(device_matches("fp-abc", "fp-abc"));
        assert!(!device_matches("fp-abc", "fp-abd"));
        assert!(!device_matches("fp-abc", "fp-abcd"));
        assert!(!device_matches("fp-abc", ""));
    }

    #[test]
    fn fingerprint_is_stable_and_order_sensitive() {
        let a = fingerprint(["Mozilla/5.0", "1920x1080", "8"]);
        assert_eq!(a, fingerprint(vec!["Mozilla/5.0".to_string(), "1920x1080".into(), "8".into()]));
        assert_ne!(a, fingerprint(["1920x1080", "Mozilla/5.0", "8"]));
        assert!(a.starts_with("fp-"));
        assert_eq!(a.len(), 35);
    }
}
