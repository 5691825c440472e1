use std::fmt::{Debug, Formatter};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::util::buf::{BufExt, BufMutExt};

/// Type tags starting with this prefix are reserved for the bus' internal request / response
///  traffic. A NUL character cannot reasonably appear in an application's type tag, so user
///  tags never collide with reserved ones.
pub const RESERVED_TYPE_PREFIX: &str = "\u{0}relaybus.";

/// Reserved: a client asks the server for aggregated transport statistics. Do not reuse.
pub const STATISTICS_REQUEST_TYPE: &str = "\u{0}relaybus.statistics.request";
/// Reserved: the server's answer to [STATISTICS_REQUEST_TYPE]. Do not reuse.
pub const STATISTICS_RESPONSE_TYPE: &str = "\u{0}relaybus.statistics.response";

/// How long a client waits for the answer to a statistics request.
pub const STATISTICS_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

pub fn is_reserved_type(type_info: &str) -> bool {
    type_info.starts_with(RESERVED_TYPE_PREFIX)
}

/// This is the unit of communication on the bus. A message is published by a client (or the
///  server), relayed by one or more servers, and delivered to zero or more clients depending on
///  their filters and the optional `target_id`.
///
/// Everything except `server_ids` and `target_id` is fixed at construction: those two are
///  rewritten by relays.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    id: String,
    server_ids: Vec<String>,
    client_id: String,
    target_id: String,
    type_info: String,
    payload: Bytes,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{id:{:?}, from:{:?}, to:{:?}, type:{:?}, via:{:?}, {} bytes}}",
               self.id, self.client_id, self.target_id, self.type_info, self.server_ids, self.payload.len())
    }
}

impl Message {
    /// Creates a broadcast message with a fresh unique id. Reserved type tags are rejected.
    pub fn new(client_id: impl Into<String>, type_info: impl Into<String>, payload: impl Into<Bytes>) -> anyhow::Result<Message> {
        Self::with_id(Uuid::new_v4().to_string(), client_id, type_info, payload)
    }

    /// Reserved type tags are rejected.
    pub fn with_id(id: impl Into<String>, client_id: impl Into<String>, type_info: impl Into<String>, payload: impl Into<Bytes>) -> anyhow::Result<Message> {
        let type_info = type_info.into();
        if is_reserved_type(&type_info) {
            bail!("type tag {:?} is reserved for internal use", type_info);
        }
        Self::unchecked(id.into(), client_id.into(), type_info, payload.into())
    }

    /// internal request / response traffic, bypassing the reserved-type check
    pub(crate) fn internal(client_id: &str, target_id: &str, type_info: &str, payload: Bytes) -> anyhow::Result<Message> {
        debug_assert!(is_reserved_type(type_info));
        Ok(Self::unchecked(Uuid::new_v4().to_string(), client_id.to_string(), type_info.to_string(), payload)?
            .targeted_at(target_id))
    }

    fn unchecked(id: String, client_id: String, type_info: String, payload: Bytes) -> anyhow::Result<Message> {
        let msg = Message {
            id,
            server_ids: Vec::new(),
            client_id,
            target_id: String::new(),
            type_info,
            payload,
        };
        msg.validate()?;
        Ok(msg)
    }

    /// builder style: address the message to a single receiver
    pub fn targeted_at(mut self, target_id: impl Into<String>) -> Message {
        self.target_id = target_id.into();
        self
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            bail!("message id must not be empty");
        }
        if self.client_id.is_empty() {
            bail!("message client id must not be empty");
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id.is_empty()
    }

    pub fn type_info(&self) -> &str {
        &self.type_info
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn server_ids(&self) -> &[String] {
        &self.server_ids
    }

    pub fn has_passed_server(&self, server_id: &str) -> bool {
        self.server_ids.iter().any(|s| s == server_id)
    }

    pub fn append_server_id(&mut self, server_id: &str) {
        self.server_ids.push(server_id.to_string());
    }

    pub(crate) fn set_relay_info(&mut self, server_ids: Vec<String>, target_id: String) {
        self.server_ids = server_ids;
        self.target_id = target_id;
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.id);
        buf.put_string(&join_server_ids(&self.server_ids));
        buf.put_string(&self.client_id);
        buf.put_string(&self.target_id);
        buf.put_string(&self.type_info);
        buf.put_blob(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let msg = Message {
            id: buf.try_read_string()?,
            server_ids: split_server_ids(&buf.try_read_string()?),
            client_id: buf.try_read_string()?,
            target_id: buf.try_read_string()?,
            type_info: buf.try_read_string()?,
            payload: buf.try_read_blob()?,
        };
        msg.validate()
            .map_err(|e| anyhow!("invalid message on the wire: {}", e))?;
        Ok(msg)
    }
}

pub(crate) fn join_server_ids(server_ids: &[String]) -> String {
    server_ids.join(",")
}

pub(crate) fn split_server_ids(joined: &str) -> Vec<String> {
    joined.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_new_assigns_unique_ids() {
        let a = Message::new("c1", "t", b"x".to_vec()).unwrap();
        let b = Message::new("c1", "t", b"x".to_vec()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.is_broadcast());
    }

    #[rstest]
    #[case::empty_client("m", "", "t")]
    #[case::empty_id("", "c", "t")]
    fn test_invalid(#[case] id: &str, #[case] client_id: &str, #[case] type_info: &str) {
        assert!(Message::with_id(id, client_id, type_info, Bytes::new()).is_err());
    }

    #[test]
    fn test_reserved_type_rejected() {
        assert!(Message::new("c1", STATISTICS_REQUEST_TYPE, Bytes::new()).is_err());
        assert!(Message::new("c1", "\u{0}relaybus.anything", Bytes::new()).is_err());
        assert!(Message::new("c1", "relaybus.statistics.request", Bytes::new()).is_ok());

        assert!(Message::with_id("m1", "c1", STATISTICS_RESPONSE_TYPE, Bytes::new()).is_err());
        assert!(Message::with_id("m1", "c1", "\u{0}relaybus.x", Bytes::new()).is_err());
    }

    #[test]
    fn test_internal_allows_reserved_types() {
        let msg = Message::internal("s1", "c1", STATISTICS_RESPONSE_TYPE, Bytes::new()).unwrap();
        assert_eq!(msg.type_info(), STATISTICS_RESPONSE_TYPE);
        assert_eq!(msg.target_id(), "c1");

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(Message::try_deser(&mut buf.freeze()).unwrap(), msg);
    }

    #[test]
    fn test_ser_deser() {
        let mut msg = Message::with_id("m1", "c1", "chat", b"hello".to_vec()).unwrap()
            .targeted_at("c2");
        msg.append_server_id("s1");
        msg.append_server_id("s2");

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        let deser = Message::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(deser, msg);
        assert_eq!(deser.server_ids(), &["s1".to_string(), "s2".to_string()]);
        assert!(deser.has_passed_server("s2"));
        assert!(!deser.has_passed_server("s3"));
    }

    #[rstest]
    #[case::empty("", vec![])]
    #[case::single("a", vec!["a"])]
    #[case::several("a,b,c", vec!["a", "b", "c"])]
    #[case::stray_commas(",a,,b,", vec!["a", "b"])]
    fn test_split_server_ids(#[case] joined: &str, #[case] expected: Vec<&str>) {
        assert_eq!(split_server_ids(joined), expected);
    }
}
