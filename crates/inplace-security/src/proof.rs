use sha2::{Digest, Sha256};

/// Checks the caller-supplied authorization proof attached to an upload.
pub trait ProofVerifier {
    fn verify(&self, proof: &str) -> bool;
}

/// Accepts a proof only when it matches a configured shared secret.
///
/// Both sides are compared as SHA-256 digests so the comparison time does not
/// depend on where the raw strings first differ.
#[derive(Clone)]
pub struct SharedSecretVerifier {
    secret_digest: Option<[u8; 32]>,
}

impl SharedSecretVerifier {
    pub fn new(secret: &str) -> Self {
        let secret = secret.trim();
        let secret_digest = if secret.is_empty() {
            None
        } else {
            Some(digest(secret))
        };
        Self { secret_digest }
    }
}

impl std::fmt::Debug for SharedSecretVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretVerifier")
            .field("configured", &self.secret_digest.is_some())
            .finish()
    }
}

impl ProofVerifier for SharedSecretVerifier {
    fn verify(&self, proof: &str) -> bool {
        let Some(expected) = &self.secret_digest else {
            return false;
        };
        let presented = digest(proof.trim());
        presented
            .iter()
            .zip(expected.iter())
            .fold(0_u8, |acc, (left, right)| acc | (left ^ right))
            == 0
    }
}

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0_u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}
