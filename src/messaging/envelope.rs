use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};

use crate::messaging::message::{join_server_ids, split_server_ids, Message};
use crate::util::buf::{BufExt, BufMutExt};

/// Routing metadata for one fragment of a message. The header is transformed (compressed and
///  encrypted) independently of the payload so relays can route and rewrite it without
///  touching the payload fragments.
#[derive(Clone, Eq, PartialEq)]
pub struct EnvelopeHeader {
    pub id: String,
    pub server_ids: Vec<String>,
    pub client_id: String,
    pub target_id: String,
    pub payload_type_info: String,
    /// 1-based
    pub chunk_index: u32,
    pub chunk_total: u32,
}

impl Debug for EnvelopeHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeHeader{{id:{:?}, from:{:?}, to:{:?}, type:{:?}, via:{:?}, chunk {}/{}}}",
               self.id, self.client_id, self.target_id, self.payload_type_info, self.server_ids, self.chunk_index, self.chunk_total)
    }
}

impl EnvelopeHeader {
    pub fn for_chunk(message: &Message, chunk_index: u32, chunk_total: u32) -> EnvelopeHeader {
        EnvelopeHeader {
            id: message.id().to_string(),
            server_ids: message.server_ids().to_vec(),
            client_id: message.client_id().to_string(),
            target_id: message.target_id().to_string(),
            payload_type_info: message.type_info().to_string(),
            chunk_index,
            chunk_total,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id.is_empty()
    }

    pub fn has_passed_server(&self, server_id: &str) -> bool {
        self.server_ids.iter().any(|s| s == server_id)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            return Err(anyhow!("envelope header without message id"));
        }
        if self.chunk_index < 1 || self.chunk_index > self.chunk_total {
            return Err(anyhow!("envelope header for {:?} has chunk index {} out of bounds 1..={}", self.id, self.chunk_index, self.chunk_total));
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.id);
        buf.put_string(&join_server_ids(&self.server_ids));
        buf.put_string(&self.client_id);
        buf.put_string(&self.target_id);
        buf.put_string(&self.payload_type_info);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.chunk_total);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EnvelopeHeader> {
        let header = EnvelopeHeader {
            id: buf.try_read_string()?,
            server_ids: split_server_ids(&buf.try_read_string()?),
            client_id: buf.try_read_string()?,
            target_id: buf.try_read_string()?,
            payload_type_info: buf.try_read_string()?,
            chunk_index: buf.try_read_u32()?,
            chunk_total: buf.try_read_u32()?,
        };
        header.validate()?;
        Ok(header)
    }
}

/// A single wire fragment: the transformed header and one raw slice of the transformed
///  message bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct TransportEnvelope {
    pub header: Bytes,
    pub payload: Bytes,
}

impl Debug for TransportEnvelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportEnvelope{{header: {} bytes, payload: {} bytes}}", self.header.len(), self.payload.len())
    }
}

impl TransportEnvelope {
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_blob(&self.header);
        buf.put_blob(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportEnvelope> {
        Ok(TransportEnvelope {
            header: buf.try_read_blob()?,
            payload: buf.try_read_blob()?,
        })
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn header(chunk_index: u32, chunk_total: u32) -> EnvelopeHeader {
        EnvelopeHeader {
            id: "m1".to_string(),
            server_ids: vec!["s1".to_string()],
            client_id: "c1".to_string(),
            target_id: "".to_string(),
            payload_type_info: "t".to_string(),
            chunk_index,
            chunk_total,
        }
    }

    #[rstest]
    #[case::single(1, 1, true)]
    #[case::last(4, 4, true)]
    #[case::zero_index(0, 4, false)]
    #[case::beyond_total(5, 4, false)]
    #[case::zero_total(1, 0, false)]
    fn test_header_bounds(#[case] chunk_index: u32, #[case] chunk_total: u32, #[case] valid: bool) {
        let h = header(chunk_index, chunk_total);
        assert_eq!(h.validate().is_ok(), valid);

        let mut buf = BytesMut::new();
        h.ser(&mut buf);
        let deser = EnvelopeHeader::try_deser(&mut buf.freeze());
        assert_eq!(deser.is_ok(), valid);
        if valid {
            assert_eq!(deser.unwrap(), h);
        }
    }

    #[test]
    fn test_header_from_message() {
        let mut msg = Message::with_id("m1", "c1", "chat", Bytes::from_static(b"abc")).unwrap()
            .targeted_at("c2");
        msg.append_server_id("s1");

        let h = EnvelopeHeader::for_chunk(&msg, 2, 3);
        assert_eq!(h.id, "m1");
        assert_eq!(h.target_id, "c2");
        assert!(!h.is_broadcast());
        assert!(h.has_passed_server("s1"));
        assert_eq!((h.chunk_index, h.chunk_total), (2, 3));
    }

    #[test]
    fn test_envelope_truncated() {
        let envelope = TransportEnvelope {
            header: Bytes::from_static(b"header"),
            payload: Bytes::from_static(b"payload"),
        };
        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        buf.truncate(buf.len() - 1);

        assert!(TransportEnvelope::try_deser(&mut buf.freeze()).is_err());
    }
}
