use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::envelope::{EnvelopeHeader, TransportEnvelope};
use crate::messaging::message::Message;
use crate::transport::cache::{EnvelopeCache, SeenMessageCache};
use crate::transport::codec::EnvelopeCodec;
use crate::transport::config::TransportConfiguration;
use crate::transport::statistics::TransportStatistics;

struct CachePair {
    envelopes: EnvelopeCache,
    seen: SeenMessageCache,
}

/// Per-endpoint transport: turns messages into envelopes and envelopes back into messages,
///  suppressing duplicates and keeping traffic statistics.
///
/// The cache pair and the statistics are guarded separately, and the statistics lock is never
///  acquired while the cache lock is held.
pub struct TransportController {
    config: TransportConfiguration,
    /// set if this controller relays on behalf of a server
    relay_id: Option<String>,
    codec: EnvelopeCodec,
    caches: Mutex<CachePair>,
    statistics: Mutex<TransportStatistics>,
}

impl TransportController {
    pub fn new(config: TransportConfiguration, relay_id: Option<String>) -> anyhow::Result<TransportController> {
        let codec = EnvelopeCodec::new(&config)?;
        Self::with_codec(config, relay_id, codec)
    }

    pub fn with_codec(config: TransportConfiguration, relay_id: Option<String>, codec: EnvelopeCodec) -> anyhow::Result<TransportController> {
        config.validate()?;
        Ok(TransportController {
            caches: Mutex::new(CachePair {
                envelopes: EnvelopeCache::new(config.envelope_cache_time_limit),
                seen: SeenMessageCache::new(config.seen_message_cache_time_limit),
            }),
            statistics: Mutex::new(TransportStatistics::new()),
            config,
            relay_id,
            codec,
        })
    }

    pub fn config(&self) -> &TransportConfiguration {
        &self.config
    }

    pub async fn prepare_for_transport(&self, message: &Message) -> anyhow::Result<Vec<TransportEnvelope>> {
        let envelopes = self.codec.encode(message)?;

        let mut stats = self.statistics.lock().await;
        stats.outgoing_messages += 1;
        for e in &envelopes {
            stats.outgoing_envelopes += 1;
            stats.outgoing_bytes += e.wire_len() as u64;
        }
        Ok(envelopes)
    }

    /// Returns a message when this envelope completes one that was not seen before. An
    ///  undecodable header is an error, incomplete and duplicate messages yield `None`.
    pub async fn ingest_fragment(&self, envelope: &TransportEnvelope) -> anyhow::Result<Option<Message>> {
        let header = self.codec.decode_header(&envelope.header)?;
        self.record_incoming_envelope(envelope).await;

        let message = {
            let mut caches = self.caches.lock().await;
            let now = Instant::now();

            let data = match caches.envelopes.add(&header, envelope.payload.clone(), now)? {
                None => {
                    trace!("fragment {}/{} of {:?} buffered", header.chunk_index, header.chunk_total, header.id);
                    return Ok(None);
                }
                Some(data) => data,
            };

            let mut message = self.codec.decode_message(&data)?;
            message.set_relay_info(header.server_ids, header.target_id);

            if !caches.seen.mark_seen(message.id(), now) {
                debug!("dropping duplicate message {:?}", message.id());
                None
            }
            else {
                Some(message)
            }
        };

        let mut message = match message {
            None => return Ok(None),
            Some(message) => message,
        };
        self.statistics.lock().await.incoming_messages += 1;

        if let Some(relay_id) = &self.relay_id {
            if message.has_passed_server(relay_id) {
                debug!("dropping {:?}: it already passed {:?}", message, relay_id);
                return Ok(None);
            }
            message.append_server_id(relay_id);
        }
        Ok(Some(message))
    }

    pub fn decode_header(&self, data: &[u8]) -> anyhow::Result<EnvelopeHeader> {
        self.codec.decode_header(data)
    }

    pub fn encode_header(&self, header: &EnvelopeHeader) -> anyhow::Result<Bytes> {
        self.codec.encode_header(header)
    }

    pub async fn record_incoming_envelope(&self, envelope: &TransportEnvelope) {
        let mut stats = self.statistics.lock().await;
        stats.incoming_envelopes += 1;
        stats.incoming_bytes += envelope.wire_len() as u64;
    }

    pub async fn record_outgoing_envelope(&self, envelope: &TransportEnvelope) {
        let mut stats = self.statistics.lock().await;
        stats.outgoing_envelopes += 1;
        stats.outgoing_bytes += envelope.wire_len() as u64;
    }

    pub async fn statistics(&self) -> TransportStatistics {
        self.statistics.lock().await.snapshot()
    }
}
