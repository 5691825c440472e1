use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::messaging::envelope::EnvelopeHeader;

struct EnvelopeGroup {
    chunk_total: u32,
    /// keyed by chunk index, so iteration yields reassembly order
    fragments: BTreeMap<u32, Bytes>,
    expires_at: Instant,
}

/// Collects fragments per message id until a message is complete. Groups that do not complete
///  within the time limit are dropped, and the partial message is lost.
///
/// There is no background sweep: expired groups are purged whenever a fragment is added.
pub struct EnvelopeCache {
    groups: FxHashMap<String, EnvelopeGroup>,
    time_limit: Duration,
}

impl EnvelopeCache {
    pub fn new(time_limit: Duration) -> EnvelopeCache {
        EnvelopeCache {
            groups: Default::default(),
            time_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn purge_expired(&mut self, now: Instant) {
        self.groups.retain(|id, group| {
            let keep = group.expires_at > now;
            if !keep {
                warn!("discarding incomplete message {:?}: {} of {} fragments received in time", id, group.fragments.len(), group.chunk_total);
            }
            keep
        });
    }

    /// Returns the concatenated fragment payloads once the last missing fragment arrives. A
    ///  fragment with a known index replaces the earlier one.
    pub fn add(&mut self, header: &EnvelopeHeader, payload: Bytes, now: Instant) -> anyhow::Result<Option<Bytes>> {
        self.purge_expired(now);

        if header.chunk_total == 1 {
            return Ok(Some(payload));
        }

        let time_limit = self.time_limit;
        let group = self.groups.entry(header.id.clone())
            .or_insert_with(|| EnvelopeGroup {
                chunk_total: header.chunk_total,
                fragments: Default::default(),
                expires_at: now + time_limit,
            });

        if group.chunk_total != header.chunk_total {
            bail!("fragment {} of message {:?} claims {} fragments, but the group has {}", header.chunk_index, header.id, header.chunk_total, group.chunk_total);
        }

        if group.fragments.insert(header.chunk_index, payload).is_some() {
            debug!("replacing duplicate fragment {} of message {:?}", header.chunk_index, header.id);
        }

        if group.fragments.len() < group.chunk_total as usize {
            return Ok(None);
        }

        match self.groups.remove(&header.id) {
            None => Ok(None),
            Some(group) => {
                let len = group.fragments.values().map(|f| f.len()).sum();
                let mut data = BytesMut::with_capacity(len);
                for fragment in group.fragments.values() {
                    data.extend_from_slice(fragment);
                }
                Ok(Some(data.freeze()))
            }
        }
    }
}

/// Remembers the ids of messages that were already handed out, to suppress duplicates.
pub struct SeenMessageCache {
    entries: FxHashMap<String, Instant>,
    time_limit: Duration,
}

impl SeenMessageCache {
    pub fn new(time_limit: Duration) -> SeenMessageCache {
        SeenMessageCache {
            entries: Default::default(),
            time_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Marks the id as seen and returns `true` if it is new. A repeated id gets its expiry
    ///  reset.
    pub fn mark_seen(&mut self, id: &str, now: Instant) -> bool {
        self.entries.retain(|_, expires_at| *expires_at > now);

        let expires_at = now + self.time_limit;
        match self.entries.get_mut(id) {
            Some(e) => {
                *e = expires_at;
                false
            }
            None => {
                self.entries.insert(id.to_string(), expires_at);
                true
            }
        }
    }
}
