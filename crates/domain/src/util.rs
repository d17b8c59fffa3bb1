use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Lowercase, ASCII alphanumerics joined by single dashes.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Dumbbell  Bench Press"), "dumbbell-bench-press");
        assert_eq!(slugify("  EZ-Bar Curl (Close Grip) "), "ez-bar-curl-close-grip");
        assert_eq!(slugify("90/90 Hip Switch"), "90-90-hip-switch");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        let digest = sha256_hex(b"bench-press");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)));
    }
}
