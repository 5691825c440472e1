use std::collections::BTreeSet;

use bytes::{Buf, BufMut};

use crate::config::tree::{key, ConfigTree, TreeConfig};
use crate::util::buf::{BufExt, BufMutExt};

/// Commas separate server ids on the wire, so they are stripped from endpoint ids.
pub fn sanitize_id(id: &str) -> String {
    id.chars().filter(|&c| c != ',').collect()
}

/// Empty means 'everything passes'.
pub fn type_passes(filter: &BTreeSet<String>, type_info: &str) -> bool {
    filter.is_empty() || filter.contains(type_info)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientConfiguration {
    id: String,
    pub receive_self_sent_messages: bool,
    /// types this client wants delivered; empty accepts all
    pub receivable_types_filter: BTreeSet<String>,
    /// types this client is allowed to send; empty allows all
    pub transmittable_types_filter: BTreeSet<String>,
}

impl ClientConfiguration {
    pub fn new(id: &str) -> ClientConfiguration {
        ClientConfiguration {
            id: sanitize_id(id),
            receive_self_sent_messages: false,
            receivable_types_filter: Default::default(),
            transmittable_types_filter: Default::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn can_receive(&self, type_info: &str) -> bool {
        type_passes(&self.receivable_types_filter, type_info)
    }

    pub fn can_transmit(&self, type_info: &str) -> bool {
        type_passes(&self.transmittable_types_filter, type_info)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("client id must not be empty");
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.id);
        buf.put_bool(self.receive_self_sent_messages);
        ser_filter(&self.receivable_types_filter, buf);
        ser_filter(&self.transmittable_types_filter, buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ClientConfiguration> {
        let id = buf.try_read_string()?;
        Ok(ClientConfiguration {
            id: sanitize_id(&id),
            receive_self_sent_messages: buf.try_read_bool()?,
            receivable_types_filter: try_deser_filter(buf)?,
            transmittable_types_filter: try_deser_filter(buf)?,
        })
    }
}

impl TreeConfig for ClientConfiguration {
    fn save(&self, tree: &mut ConfigTree, prefix: &str) {
        tree.set(key(prefix, "id"), &self.id);
        tree.set(key(prefix, "receive_self_sent_messages"), self.receive_self_sent_messages);
        tree.set_list(&key(prefix, "receivable_types_filter"), &self.receivable_types_filter);
        tree.set_list(&key(prefix, "transmittable_types_filter"), &self.transmittable_types_filter);
    }

    fn load(tree: &ConfigTree, prefix: &str) -> anyhow::Result<ClientConfiguration> {
        let id = tree.get(&key(prefix, "id"))
            .ok_or_else(|| anyhow::anyhow!("missing configuration key {}", key(prefix, "id")))?;

        let mut result = ClientConfiguration::new(id);
        result.receive_self_sent_messages = tree.get_or(&key(prefix, "receive_self_sent_messages"), false)?;
        result.receivable_types_filter = load_filter(tree, &key(prefix, "receivable_types_filter"))?;
        result.transmittable_types_filter = load_filter(tree, &key(prefix, "transmittable_types_filter"))?;
        result.validate()?;
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerConfiguration {
    id: String,
    /// types in this set are delivered to every client regardless of the client's filters
    pub override_types_filter: BTreeSet<String>,
}

impl ServerConfiguration {
    pub fn new(id: &str) -> ServerConfiguration {
        ServerConfiguration {
            id: sanitize_id(id),
            override_types_filter: Default::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_override_type(&self, type_info: &str) -> bool {
        self.override_types_filter.contains(type_info)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("server id must not be empty");
        }
        Ok(())
    }
}

impl TreeConfig for ServerConfiguration {
    fn save(&self, tree: &mut ConfigTree, prefix: &str) {
        tree.set(key(prefix, "id"), &self.id);
        tree.set_list(&key(prefix, "override_types_filter"), &self.override_types_filter);
    }

    fn load(tree: &ConfigTree, prefix: &str) -> anyhow::Result<ServerConfiguration> {
        let id = tree.get(&key(prefix, "id"))
            .ok_or_else(|| anyhow::anyhow!("missing configuration key {}", key(prefix, "id")))?;

        let mut result = ServerConfiguration::new(id);
        result.override_types_filter = load_filter(tree, &key(prefix, "override_types_filter"))?;
        result.validate()?;
        Ok(result)
    }
}

fn ser_filter(filter: &BTreeSet<String>, buf: &mut impl BufMut) {
    buf.put_len(filter.len());
    for t in filter {
        buf.put_string(t);
    }
}

fn try_deser_filter(buf: &mut impl Buf) -> anyhow::Result<BTreeSet<String>> {
    let len = buf.try_read_len()?;
    let mut result = BTreeSet::new();
    for _ in 0..len {
        result.insert(buf.try_read_string()?);
    }
    Ok(result)
}

fn load_filter(tree: &ConfigTree, key: &str) -> anyhow::Result<BTreeSet<String>> {
    Ok(tree.get_list(key)?
        .unwrap_or_default()
        .into_iter()
        .collect())
}
