mod checksum;
mod proof;

pub use checksum::{sha256_file_hex, sha256_hex, sha256_reader_hex};
pub use proof::{ProofVerifier, SharedSecretVerifier};
