use std::sync::atomic::{AtomicU64, Ordering};

use aead::{AeadCore, AeadInPlace, Key, KeyInit, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail};
use bytes::{Buf, BytesMut};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::transport::config::EncryptorConfiguration;

/// Transforms a whole buffer in place. Implementations must be deterministic in the sense that
///  `decrypt(encrypt(x)) == x` on any peer configured identically.
#[cfg_attr(test, mockall::automock)]
pub trait Encryptor: Send + Sync + 'static {
    fn encrypt(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn decrypt(&self, buf: &mut BytesMut) -> anyhow::Result<()>;
}

pub struct NoEncryption;
impl Encryptor for NoEncryption {
    fn encrypt(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }

    fn decrypt(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }
}

/// AES-256-GCM with the key derived as SHA-256 of a passphrase. Every buffer gets a unique
///  96-bit nonce (random per instance plus a counter) which is prefixed to the ciphertext.
pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmEncryption {
    const NONCE_LEN: usize = 12;

    pub fn new(passphrase: &str) -> Aes256GcmEncryption {
        let key_bytes = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(key_bytes.as_slice());
        let cipher = Aes256Gcm::new(key);

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut nonce_buf = nonce.as_slice();
        let nonce_fixed = nonce_buf.get_u32();
        let nonce_incremented = AtomicU64::new(nonce_buf.get_u64());

        Aes256GcmEncryption {
            cipher,
            nonce_fixed,
            nonce_incremented,
        }
    }

    fn unique_nonce(&self) -> Nonce<Aes256Gcm> {
        let mut raw = [0u8; Self::NONCE_LEN];
        raw[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        raw[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        Nonce::<Aes256Gcm>::clone_from_slice(&raw)
    }
}

impl Encryptor for Aes256GcmEncryption {
    fn encrypt(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let nonce = self.unique_nonce();
        self.cipher.encrypt_in_place(&nonce, b"", buf)
            .map_err(|_| anyhow!("error encrypting buffer"))?;

        let mut result = BytesMut::with_capacity(Self::NONCE_LEN + buf.len());
        result.extend_from_slice(nonce.as_slice());
        result.extend_from_slice(buf);
        *buf = result;
        Ok(())
    }

    fn decrypt(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if buf.len() < Self::NONCE_LEN {
            bail!("encrypted buffer too short: {} bytes", buf.len());
        }

        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&buf[..Self::NONCE_LEN]);
        buf.advance(Self::NONCE_LEN);
        trace!("decrypting {} bytes", buf.len());
        self.cipher.decrypt_in_place(&nonce, b"", buf)
            .map_err(|_| anyhow!("decryption error"))
    }
}

/// An ordered chain of encryptors: applied front to back when encrypting, back to front when
///  decrypting.
pub struct ComposedEncryption {
    stages: Vec<Box<dyn Encryptor>>,
}

impl ComposedEncryption {
    pub fn new(stages: Vec<Box<dyn Encryptor>>) -> ComposedEncryption {
        ComposedEncryption {
            stages,
        }
    }

    pub fn from_config(configurations: &[EncryptorConfiguration]) -> ComposedEncryption {
        let stages = configurations.iter()
            .map(|c| -> Box<dyn Encryptor> {
                match c {
                    EncryptorConfiguration::Aes256Gcm { passphrase } => Box::new(Aes256GcmEncryption::new(passphrase)),
                }
            })
            .collect();
        ComposedEncryption::new(stages)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Encryptor for ComposedEncryption {
    fn encrypt(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        for stage in &self.stages {
            stage.encrypt(buf)?;
        }
        Ok(())
    }

    fn decrypt(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        for stage in self.stages.iter().rev() {
            stage.decrypt(buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use mockall::Sequence;
    use super::*;

    #[test]
    fn test_aes_round_trip() {
        let sender = Aes256GcmEncryption::new("secret");
        let receiver = Aes256GcmEncryption::new("secret");

        let mut buf = BytesMut::from(&b"hello world"[..]);
        sender.encrypt(&mut buf).unwrap();
        assert_ne!(&buf[..], b"hello world");
        assert_eq!(buf.len(), 12 + 11 + 16);

        receiver.decrypt(&mut buf).unwrap();
        assert_eq!(&buf[..], b"hello world");
    }

    #[test]
    fn test_aes_nonces_differ() {
        let encryption = Aes256GcmEncryption::new("secret");
        let mut a = BytesMut::from(&b"same"[..]);
        let mut b = BytesMut::from(&b"same"[..]);
        encryption.encrypt(&mut a).unwrap();
        encryption.encrypt(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes_wrong_passphrase() {
        let mut buf = BytesMut::from(&b"hello world"[..]);
        Aes256GcmEncryption::new("secret").encrypt(&mut buf).unwrap();
        assert!(Aes256GcmEncryption::new("other").decrypt(&mut buf).is_err());
    }

    #[test]
    fn test_aes_short_buffer() {
        let mut buf = BytesMut::from(&b"short"[..]);
        assert!(Aes256GcmEncryption::new("secret").decrypt(&mut buf).is_err());
    }

    #[test]
    fn test_composed_reverses_order() {
        let mut seq = Sequence::new();
        let mut first = MockEncryptor::new();
        let mut second = MockEncryptor::new();

        first.expect_encrypt().times(1).in_sequence(&mut seq).returning(|buf| { buf.extend_from_slice(b"1"); Ok(()) });
        second.expect_encrypt().times(1).in_sequence(&mut seq).returning(|buf| { buf.extend_from_slice(b"2"); Ok(()) });
        second.expect_decrypt().times(1).in_sequence(&mut seq).returning(|buf| { buf.truncate(buf.len() - 1); Ok(()) });
        first.expect_decrypt().times(1).in_sequence(&mut seq).returning(|buf| { buf.truncate(buf.len() - 1); Ok(()) });

        let composed = ComposedEncryption::new(vec![Box::new(first), Box::new(second)]);
        let mut buf = BytesMut::from(&b"x"[..]);
        composed.encrypt(&mut buf).unwrap();
        assert_eq!(&buf[..], b"x12");
        composed.decrypt(&mut buf).unwrap();
        assert_eq!(&buf[..], b"x");
    }

    #[test]
    fn test_composed_from_config() {
        let config = vec![
            EncryptorConfiguration::Aes256Gcm { passphrase: "a".to_string() },
            EncryptorConfiguration::Aes256Gcm { passphrase: "b".to_string() },
        ];
        let sender = ComposedEncryption::from_config(&config);
        let receiver = ComposedEncryption::from_config(&config);

        let mut buf = BytesMut::from(&b"payload"[..]);
        sender.encrypt(&mut buf).unwrap();
        receiver.decrypt(&mut buf).unwrap();
        assert_eq!(&buf[..], b"payload");

        assert!(ComposedEncryption::from_config(&[]).is_empty());
    }
}
