use sha2::{Digest, Sha256};

// Device tokens are delivery credentials; logs only ever carry this fingerprint
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fingerprint() {
        let a = token_fingerprint("ExponentPushToken[abc]");
        let b = token_fingerprint("ExponentPushToken[abc]");
        let c = token_fingerprint("ExponentPushToken[abd]");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(!a.contains("abc"));
    }
}
