use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies a source file by content, used to short-circuit a run to
/// `no_change` when the upstream file hasn't moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub sha256: String,
    pub size: u64,
}

impl SourceFingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            sha256: format!("{:x}", hasher.finalize()),
            size: bytes.len() as u64,
        }
    }
}
