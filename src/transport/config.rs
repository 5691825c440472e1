use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::tree::{key, ConfigTree, TreeConfig};
use crate::util::buf::{BufExt, BufMutExt};

pub const MIN_CHUNK_SIZE: usize = 512;
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Dynamic / private port range (RFC 6335). Bindings that listen on a port should pick one
///  from this range.
pub const RECOMMENDED_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum CompressorType {
    None = 0,
    Deflate = 1,
}

impl CompressorType {
    fn as_config_str(&self) -> &'static str {
        match self {
            CompressorType::None => "none",
            CompressorType::Deflate => "deflate",
        }
    }

    fn from_config_str(s: &str) -> anyhow::Result<CompressorType> {
        match s {
            "none" => Ok(CompressorType::None),
            "deflate" => Ok(CompressorType::Deflate),
            other => Err(anyhow!("unknown compressor type {:?}", other)),
        }
    }
}

/// One stage of the encryption pipeline. Stages are applied in list order when sending and in
///  reverse order when receiving.
#[derive(Clone, Eq, PartialEq)]
pub enum EncryptorConfiguration {
    Aes256Gcm { passphrase: String },
}

impl std::fmt::Debug for EncryptorConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptorConfiguration::Aes256Gcm { .. } => write!(f, "Aes256Gcm{{..}}"),
        }
    }
}

impl EncryptorConfiguration {
    const ID_AES_256_GCM: u8 = 1;

    fn ser(&self, buf: &mut impl BufMut) {
        match self {
            EncryptorConfiguration::Aes256Gcm { passphrase } => {
                buf.put_u8(Self::ID_AES_256_GCM);
                buf.put_string(passphrase);
            }
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EncryptorConfiguration> {
        match buf.try_read_u8()? {
            Self::ID_AES_256_GCM => Ok(EncryptorConfiguration::Aes256Gcm { passphrase: buf.try_read_string()? }),
            id => Err(anyhow!("invalid encryptor discriminator {}", id)),
        }
    }
}

/// The parameters both ends of a connection must agree on. The server owns the authoritative
///  copy and hands it to every client in the registration response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportConfiguration {
    pub server_id: String,
    pub compressor_type: CompressorType,
    pub encryptor_configurations: Vec<EncryptorConfiguration>,
    pub use_chunking: bool,
    /// upper bound for the payload of a single envelope, >= [MIN_CHUNK_SIZE]
    pub chunk_size: usize,
    /// incomplete fragment groups are discarded after this time
    pub envelope_cache_time_limit: Duration,
    /// duplicates of a message arriving within this time are suppressed
    pub seen_message_cache_time_limit: Duration,
}

impl TransportConfiguration {
    pub fn new(server_id: &str) -> TransportConfiguration {
        TransportConfiguration {
            server_id: server_id.to_string(),
            compressor_type: CompressorType::None,
            encryptor_configurations: Vec::new(),
            use_chunking: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            envelope_cache_time_limit: Duration::from_secs(30),
            seen_message_cache_time_limit: Duration::from_secs(120),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            bail!("chunk size {} is below the minimum of {}", self.chunk_size, MIN_CHUNK_SIZE);
        }
        if self.envelope_cache_time_limit.is_zero() {
            bail!("envelope cache time limit must be positive");
        }
        if self.seen_message_cache_time_limit.is_zero() {
            bail!("seen message cache time limit must be positive");
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.server_id);
        buf.put_u8(self.compressor_type.into());
        buf.put_len(self.encryptor_configurations.len());
        for e in &self.encryptor_configurations {
            e.ser(buf);
        }
        buf.put_bool(self.use_chunking);
        buf.put_len(self.chunk_size);
        buf.put_u64(self.envelope_cache_time_limit.as_millis() as u64);
        buf.put_u64(self.seen_message_cache_time_limit.as_millis() as u64);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportConfiguration> {
        let server_id = buf.try_read_string()?;
        let compressor_type = CompressorType::try_from(buf.try_read_u8()?)
            .map_err(|e| anyhow!("invalid compressor discriminator {}", e.number))?;

        let num_encryptors = buf.try_read_len()?;
        let mut encryptor_configurations = Vec::new();
        for _ in 0..num_encryptors {
            encryptor_configurations.push(EncryptorConfiguration::try_deser(buf)?);
        }

        let result = TransportConfiguration {
            server_id,
            compressor_type,
            encryptor_configurations,
            use_chunking: buf.try_read_bool()?,
            chunk_size: buf.try_read_len()?,
            envelope_cache_time_limit: Duration::from_millis(buf.try_read_u64()?),
            seen_message_cache_time_limit: Duration::from_millis(buf.try_read_u64()?),
        };
        result.validate()?;
        Ok(result)
    }
}

impl TreeConfig for TransportConfiguration {
    fn save(&self, tree: &mut ConfigTree, prefix: &str) {
        tree.set(key(prefix, "server_id"), &self.server_id);
        tree.set(key(prefix, "compressor"), self.compressor_type.as_config_str());

        let passphrases = self.encryptor_configurations.iter()
            .map(|e| match e {
                EncryptorConfiguration::Aes256Gcm { passphrase } => passphrase.clone(),
            })
            .collect::<Vec<_>>();
        tree.set_list(&key(prefix, "encryption.aes256gcm"), &passphrases);

        tree.set(key(prefix, "use_chunking"), self.use_chunking);
        tree.set(key(prefix, "chunk_size"), self.chunk_size);
        tree.set_duration(key(prefix, "envelope_cache_time_limit_ms"), self.envelope_cache_time_limit);
        tree.set_duration(key(prefix, "seen_message_cache_time_limit_ms"), self.seen_message_cache_time_limit);
    }

    fn load(tree: &ConfigTree, prefix: &str) -> anyhow::Result<TransportConfiguration> {
        let server_id = tree.get(&key(prefix, "server_id"))
            .ok_or_else(|| anyhow!("missing configuration key {}", key(prefix, "server_id")))?;
        let defaults = TransportConfiguration::new(server_id);

        let compressor_type = match tree.get(&key(prefix, "compressor")) {
            None => defaults.compressor_type,
            Some(s) => CompressorType::from_config_str(s.trim())?,
        };

        let encryptor_configurations = tree.get_list(&key(prefix, "encryption.aes256gcm"))?
            .unwrap_or_default()
            .into_iter()
            .map(|passphrase| EncryptorConfiguration::Aes256Gcm { passphrase })
            .collect();

        let result = TransportConfiguration {
            compressor_type,
            encryptor_configurations,
            use_chunking: tree.get_or(&key(prefix, "use_chunking"), defaults.use_chunking)?,
            chunk_size: tree.get_or(&key(prefix, "chunk_size"), defaults.chunk_size)?,
            envelope_cache_time_limit: tree.get_duration_or(&key(prefix, "envelope_cache_time_limit_ms"), defaults.envelope_cache_time_limit)?,
            seen_message_cache_time_limit: tree.get_duration_or(&key(prefix, "seen_message_cache_time_limit_ms"), defaults.seen_message_cache_time_limit)?,
            ..defaults
        };
        result.validate()?;
        Ok(result)
    }
}
