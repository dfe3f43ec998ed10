//! PKCE helpers (RFC 7636, S256 method only).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha2::{Digest, Sha256};

/// Longest verifier RFC 7636 allows.
pub const VERIFIER_LENGTH: usize = 128;

/// Generate a random code verifier from the unreserved alphanumeric set.
pub fn generate_verifier() -> String {
    random_string(VERIFIER_LENGTH)
}

/// Generate an opaque value for the OAuth `state` parameter.
pub fn generate_state() -> String {
    random_string(32)
}

/// `base64url(SHA256(verifier))` without padding.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_rfc7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn challenge_is_unpadded_url_safe() {
        let challenge = code_challenge(&generate_verifier());
        assert_eq!(challenge.len(), 43);
        assert!(!challenge.contains('='));
        assert!(!challenge.contains('+'));
        assert!(!challenge.contains('/'));
    }

    #[test]
    fn verifier_has_max_length_and_is_random() {
        let first = generate_verifier();
        let second = generate_verifier();

        assert_eq!(first.len(), VERIFIER_LENGTH);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, second);
    }
}
