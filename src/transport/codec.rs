use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::messaging::envelope::{EnvelopeHeader, TransportEnvelope};
use crate::messaging::message::Message;
use crate::transport::compression::{compressor_for, Compressor};
use crate::transport::config::TransportConfiguration;
use crate::transport::encryption::{ComposedEncryption, Encryptor};

/// Converts between messages and wire fragments. Outbound data is compressed, then encrypted;
///  inbound data goes through the reverse steps. Headers and message bytes are transformed
///  independently.
pub struct EnvelopeCodec {
    compressor: Box<dyn Compressor>,
    encryptor: Box<dyn Encryptor>,
    use_chunking: bool,
    chunk_size: usize,
}

impl EnvelopeCodec {
    /// Fails if `config` does not validate.
    pub fn new(config: &TransportConfiguration) -> anyhow::Result<EnvelopeCodec> {
        Self::with_codecs(
            config,
            compressor_for(config.compressor_type),
            Box::new(ComposedEncryption::from_config(&config.encryptor_configurations)),
        )
    }

    pub fn with_codecs(config: &TransportConfiguration, compressor: Box<dyn Compressor>, encryptor: Box<dyn Encryptor>) -> anyhow::Result<EnvelopeCodec> {
        config.validate()?;
        Ok(EnvelopeCodec {
            compressor,
            encryptor,
            use_chunking: config.use_chunking,
            chunk_size: config.chunk_size,
        })
    }

    fn transform(&self, mut buf: BytesMut) -> anyhow::Result<Bytes> {
        self.compressor.compress(&mut buf)?;
        self.encryptor.encrypt(&mut buf)?;
        Ok(buf.freeze())
    }

    fn untransform(&self, data: &[u8]) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::from(data);
        self.encryptor.decrypt(&mut buf)?;
        self.compressor.decompress(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_header(&self, header: &EnvelopeHeader) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        self.transform(buf)
    }

    pub fn decode_header(&self, data: &[u8]) -> anyhow::Result<EnvelopeHeader> {
        let buf = self.untransform(data)?;
        EnvelopeHeader::try_deser(&mut buf.freeze())
    }

    pub fn decode_message(&self, data: &[u8]) -> anyhow::Result<Message> {
        let buf = self.untransform(data)?;
        Message::try_deser(&mut buf.freeze())
    }

    /// A transformed message of S bytes results in `ceil(S / chunk_size)` envelopes if chunking
    ///  is on, otherwise in exactly one.
    pub fn encode(&self, message: &Message) -> anyhow::Result<Vec<TransportEnvelope>> {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        let data = self.transform(buf)?;

        let pieces = if self.use_chunking && data.len() > self.chunk_size {
            let mut pieces = Vec::with_capacity(data.len().div_ceil(self.chunk_size));
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + self.chunk_size).min(data.len());
                pieces.push(data.slice(offset..end));
                offset = end;
            }
            pieces
        }
        else {
            vec![data]
        };

        let chunk_total = u32::try_from(pieces.len())?;
        trace!("encoding {:?} into {} envelope(s)", message, chunk_total);

        let mut result = Vec::with_capacity(pieces.len());
        for (idx, payload) in pieces.into_iter().enumerate() {
            let header = EnvelopeHeader::for_chunk(message, idx as u32 + 1, chunk_total);
            result.push(TransportEnvelope {
                header: self.encode_header(&header)?,
                payload,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use crate::transport::config::{CompressorType, EncryptorConfiguration};
    use crate::transport::controller::TransportController;
    use super::*;

    fn config(chunk_size: usize, use_chunking: bool) -> TransportConfiguration {
        let mut config = TransportConfiguration::new("s1");
        config.chunk_size = chunk_size;
        config.use_chunking = use_chunking;
        config
    }

    #[rstest]
    #[case::fits(16384, true, 1)]
    #[case::split(512, true, 4)]
    #[case::chunking_off(512, false, 1)]
    fn test_envelope_count(#[case] chunk_size: usize, #[case] use_chunking: bool, #[case] expected: usize) {
        let codec = EnvelopeCodec::new(&config(chunk_size, use_chunking)).unwrap();
        let msg = Message::with_id("msg-1", "c1", "t", vec![7u8; 2000]).unwrap();

        let envelopes = codec.encode(&msg).unwrap();
        assert_eq!(envelopes.len(), expected);
        for (i, e) in envelopes.iter().enumerate() {
            let header = codec.decode_header(&e.header).unwrap();
            assert_eq!(header.id, "msg-1");
            assert_eq!(header.chunk_index as usize, i + 1);
            assert_eq!(header.chunk_total as usize, expected);
            if use_chunking {
                assert!(e.payload.len() <= chunk_size);
            }
        }
    }

    #[rstest]
    #[case::plain(CompressorType::None, vec![])]
    #[case::deflate(CompressorType::Deflate, vec![])]
    #[case::aes(CompressorType::None, vec!["k1"])]
    #[case::deflate_aes_aes(CompressorType::Deflate, vec!["k1", "k2"])]
    fn test_codecs(#[case] compressor_type: CompressorType, #[case] passphrases: Vec<&str>) {
        let mut config = config(512, true);
        config.compressor_type = compressor_type;
        config.encryptor_configurations = passphrases.iter()
            .map(|p| EncryptorConfiguration::Aes256Gcm { passphrase: p.to_string() })
            .collect();

        let sender = EnvelopeCodec::new(&config).unwrap();
        let receiver = EnvelopeCodec::new(&config).unwrap();

        let msg = Message::with_id("m", "c1", "t", b"some payload that is long enough to compress ".repeat(40)).unwrap();
        let envelopes = sender.encode(&msg).unwrap();

        let mut data = BytesMut::new();
        for e in &envelopes {
            assert!(receiver.decode_header(&e.header).is_ok());
            data.extend_from_slice(&e.payload);
        }
        assert_eq!(receiver.decode_message(&data).unwrap(), msg);
    }

    #[rstest]
    #[case::below_minimum(100, true)]
    #[case::zero_without_chunking(0, false)]
    fn test_invalid_config_rejected(#[case] chunk_size: usize, #[case] use_chunking: bool) {
        assert!(EnvelopeCodec::new(&config(chunk_size, use_chunking)).is_err());
        assert!(TransportController::new(config(chunk_size, use_chunking), None).is_err());
    }

    #[test]
    fn test_undecodable_header() {
        let codec = EnvelopeCodec::new(&config(512, true)).unwrap();
        assert!(codec.decode_header(b"\x05abc").is_err());

        let mut aes_config = config(512, true);
        aes_config.encryptor_configurations.push(EncryptorConfiguration::Aes256Gcm { passphrase: "x".to_string() });
        let plain = codec.encode_header(&EnvelopeHeader::for_chunk(&Message::with_id("m", "c", "t", Bytes::new()).unwrap(), 1, 1)).unwrap();
        assert!(EnvelopeCodec::new(&aes_config).unwrap().decode_header(&plain).is_err());
    }
}
