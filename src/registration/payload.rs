use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::endpoint::ClientConfiguration;
use crate::util::buf::{BufExt, BufMutExt};

/// Sent by a client for both registering and unregistering; the
///  [RegistrationKind](crate::rpc::RegistrationKind) travels alongside.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegistrationPayload {
    pub client_configuration: ClientConfiguration,
    pub evidence: Bytes,
}

impl RegistrationPayload {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.client_configuration.ser(buf);
        buf.put_blob(&self.evidence);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RegistrationPayload> {
        Ok(RegistrationPayload {
            client_configuration: ClientConfiguration::try_deser(buf)?,
            evidence: buf.try_read_blob()?,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}
