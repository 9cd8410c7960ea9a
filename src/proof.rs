//! Proof tokens: the secret a CI job echoes into its log so we can tell
//! the build asking for an OTP is the one we are looking at.

use crate::config::ProofConfig;
use rand::RngCore;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Number of random bytes behind every proof
pub const PROOF_BYTES: usize = 2048;

/// Generate a fresh proof: 2048 random bytes, lowercase hex
pub fn generate_proof() -> String {
    let mut bytes = vec![0u8; PROOF_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// True when the trimmed output ends with a `Proof:` line followed by
/// the proof on the next line (LF or CRLF).
pub fn output_contains_proof(output: &str, proof: &str) -> bool {
    if proof.is_empty() {
        return false;
    }
    let Some(before) = output.trim().strip_suffix(proof) else {
        return false;
    };
    before.ends_with("Proof:\n") || before.ends_with("Proof:\r\n")
}

/// Bounded retry schedule for proof lookups
#[derive(Debug, Clone, Copy)]
pub struct ProofPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ProofPolicy {
    fn default() -> Self {
        Self::from(&ProofConfig::default())
    }
}

impl From<&ProofConfig> for ProofPolicy {
    fn from(config: &ProofConfig) -> Self {
        Self {
            attempts: config.attempts,
            delay: config.delay(),
        }
    }
}

impl ProofPolicy {
    /// Run `check` until it reports the proof or the attempts run out.
    /// Sleeps between attempts, never after the last one.
    pub async fn poll<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.attempts {
            if check(attempt).await {
                return true;
            }
            debug!("Proof not visible yet (attempt {}/{})", attempt, self.attempts);
            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        false
    }
}
