use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::config::tree::{key, ConfigTree, TreeConfig};

/// Proof that a registering client is entitled to join. The client creates evidence, the
///  server validates it.
#[cfg_attr(test, mockall::automock)]
pub trait ChallengeController: Send + Sync + 'static {
    fn create_evidence(&self, client_id: &str) -> Bytes;

    fn validate_evidence(&self, client_id: &str, evidence: &[u8]) -> anyhow::Result<()>;
}

/// Accepts every client.
pub struct NoChallenge;
impl ChallengeController for NoChallenge {
    fn create_evidence(&self, _client_id: &str) -> Bytes {
        Bytes::new()
    }

    fn validate_evidence(&self, _client_id: &str, _evidence: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Both sides know a shared secret; the evidence is a SHA-256 digest binding the secret to the
///  client id, so it cannot be replayed for a different id.
pub struct SharedSecretChallenge {
    secret: Vec<u8>,
}

impl SharedSecretChallenge {
    const DOMAIN_TAG: &'static [u8] = b"relaybus-registration-v1";

    pub fn new(secret: &[u8]) -> SharedSecretChallenge {
        SharedSecretChallenge {
            secret: secret.to_vec(),
        }
    }

    fn digest(&self, client_id: &str) -> Bytes {
        let mut hasher = Sha256::new();
        hasher.update(Self::DOMAIN_TAG);
        hasher.update([0u8]);
        hasher.update(client_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(&self.secret);
        Bytes::copy_from_slice(hasher.finalize().as_slice())
    }
}

impl ChallengeController for SharedSecretChallenge {
    fn create_evidence(&self, client_id: &str) -> Bytes {
        self.digest(client_id)
    }

    fn validate_evidence(&self, client_id: &str, evidence: &[u8]) -> anyhow::Result<()> {
        let expected = self.digest(client_id);
        // no early exit on the first differing byte
        let matches = expected.len() == evidence.len()
            && expected.iter().zip(evidence).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0;
        if !matches {
            bail!("invalid registration evidence for client {:?}", client_id);
        }
        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub enum ChallengeConfiguration {
    None,
    SharedSecret { secret: String },
}

impl std::fmt::Debug for ChallengeConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeConfiguration::None => write!(f, "None"),
            ChallengeConfiguration::SharedSecret { .. } => write!(f, "SharedSecret{{..}}"),
        }
    }
}

impl ChallengeConfiguration {
    pub fn build(&self) -> Arc<dyn ChallengeController> {
        match self {
            ChallengeConfiguration::None => Arc::new(NoChallenge),
            ChallengeConfiguration::SharedSecret { secret } => Arc::new(SharedSecretChallenge::new(secret.as_bytes())),
        }
    }
}

impl TreeConfig for ChallengeConfiguration {
    fn save(&self, tree: &mut ConfigTree, prefix: &str) {
        match self {
            ChallengeConfiguration::None => {
                tree.set(key(prefix, "type"), "none");
            }
            ChallengeConfiguration::SharedSecret { secret } => {
                tree.set(key(prefix, "type"), "shared_secret");
                tree.set(key(prefix, "secret"), secret);
            }
        }
    }

    fn load(tree: &ConfigTree, prefix: &str) -> anyhow::Result<ChallengeConfiguration> {
        match tree.get(&key(prefix, "type")).map(|s| s.trim()) {
            None | Some("none") => Ok(ChallengeConfiguration::None),
            Some("shared_secret") => {
                let secret = tree.get(&key(prefix, "secret"))
                    .ok_or_else(|| anyhow!("missing configuration key {}", key(prefix, "secret")))?;
                Ok(ChallengeConfiguration::SharedSecret { secret: secret.to_string() })
            }
            Some(other) => Err(anyhow!("unknown challenge type {:?}", other)),
        }
    }
}

/// Configuration of the registration controllers on both sides.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegistrationConfiguration {
    pub challenge: ChallengeConfiguration,
}

impl RegistrationConfiguration {
    pub fn new() -> RegistrationConfiguration {
        RegistrationConfiguration {
            challenge: ChallengeConfiguration::None,
        }
    }
}

impl Default for RegistrationConfiguration {
    fn default() -> Self {
        RegistrationConfiguration::new()
    }
}

impl TreeConfig for RegistrationConfiguration {
    fn save(&self, tree: &mut ConfigTree, prefix: &str) {
        self.challenge.save(tree, &key(prefix, "challenge"));
    }

    fn load(tree: &ConfigTree, prefix: &str) -> anyhow::Result<RegistrationConfiguration> {
        Ok(RegistrationConfiguration {
            challenge: ChallengeConfiguration::load(tree, &key(prefix, "challenge"))?,
        })
    }
}
