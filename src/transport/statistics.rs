use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use crate::util::buf::{BufExt, BufMutExt};

pub fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Change per second between two samples of a monotonic counter; 0.0 if no time passed.
pub fn rate_per_second(current_total: u64, previous_total: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    current_total.saturating_sub(previous_total) as f64 / secs
}

/// Monotonic traffic counters of a single endpoint. Instances are plain values: the owning
///  controller keeps one behind a lock and hands out copies.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TransportStatistics {
    /// ms since epoch
    pub started: u64,
    /// ms since epoch when this copy was taken
    pub sampled: u64,
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub incoming_envelopes: u64,
    pub outgoing_envelopes: u64,
    pub incoming_messages: u64,
    pub outgoing_messages: u64,
}

impl TransportStatistics {
    pub fn new() -> TransportStatistics {
        let now = millis_since_epoch();
        TransportStatistics {
            started: now,
            sampled: now,
            incoming_bytes: 0,
            outgoing_bytes: 0,
            incoming_envelopes: 0,
            outgoing_envelopes: 0,
            incoming_messages: 0,
            outgoing_messages: 0,
        }
    }

    pub fn snapshot(&self) -> TransportStatistics {
        TransportStatistics {
            sampled: millis_since_epoch(),
            ..*self
        }
    }

    fn elapsed_since(&self, previous: &TransportStatistics) -> Duration {
        Duration::from_millis(self.sampled.saturating_sub(previous.sampled))
    }

    pub fn incoming_bytes_per_second(&self, previous: &TransportStatistics) -> f64 {
        rate_per_second(self.incoming_bytes, previous.incoming_bytes, self.elapsed_since(previous))
    }

    pub fn outgoing_bytes_per_second(&self, previous: &TransportStatistics) -> f64 {
        rate_per_second(self.outgoing_bytes, previous.outgoing_bytes, self.elapsed_since(previous))
    }

    pub fn incoming_envelopes_per_second(&self, previous: &TransportStatistics) -> f64 {
        rate_per_second(self.incoming_envelopes, previous.incoming_envelopes, self.elapsed_since(previous))
    }

    pub fn outgoing_envelopes_per_second(&self, previous: &TransportStatistics) -> f64 {
        rate_per_second(self.outgoing_envelopes, previous.outgoing_envelopes, self.elapsed_since(previous))
    }

    pub fn incoming_messages_per_second(&self, previous: &TransportStatistics) -> f64 {
        rate_per_second(self.incoming_messages, previous.incoming_messages, self.elapsed_since(previous))
    }

    pub fn outgoing_messages_per_second(&self, previous: &TransportStatistics) -> f64 {
        rate_per_second(self.outgoing_messages, previous.outgoing_messages, self.elapsed_since(previous))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.started);
        buf.put_u64(self.sampled);
        buf.put_u64(self.incoming_bytes);
        buf.put_u64(self.outgoing_bytes);
        buf.put_u64(self.incoming_envelopes);
        buf.put_u64(self.outgoing_envelopes);
        buf.put_u64(self.incoming_messages);
        buf.put_u64(self.outgoing_messages);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportStatistics> {
        Ok(TransportStatistics {
            started: buf.try_read_u64()?,
            sampled: buf.try_read_u64()?,
            incoming_bytes: buf.try_read_u64()?,
            outgoing_bytes: buf.try_read_u64()?,
            incoming_envelopes: buf.try_read_u64()?,
            outgoing_envelopes: buf.try_read_u64()?,
            incoming_messages: buf.try_read_u64()?,
            outgoing_messages: buf.try_read_u64()?,
        })
    }
}

impl Default for TransportStatistics {
    fn default() -> Self {
        TransportStatistics::new()
    }
}

/// Aggregated view across a server: its relay, its internal client and every registered client
///  that answered in time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatisticsReport {
    pub server: TransportStatistics,
    pub internal_client: TransportStatistics,
    pub clients: BTreeMap<String, TransportStatistics>,
}

impl StatisticsReport {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.server.ser(buf);
        self.internal_client.ser(buf);
        buf.put_len(self.clients.len());
        for (id, stats) in &self.clients {
            buf.put_string(id);
            stats.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StatisticsReport> {
        let server = TransportStatistics::try_deser(buf)?;
        let internal_client = TransportStatistics::try_deser(buf)?;

        let num_clients = buf.try_read_len()?;
        let mut clients = BTreeMap::new();
        for _ in 0..num_clients {
            let id = buf.try_read_string()?;
            clients.insert(id, TransportStatistics::try_deser(buf)?);
        }

        Ok(StatisticsReport {
            server,
            internal_client,
            clients,
        })
    }
}

/// Payload of the reserved statistics response; `request_id` is the id of the request message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatisticsResponse {
    pub request_id: String,
    pub report: StatisticsReport,
}

impl StatisticsResponse {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.request_id);
        self.report.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StatisticsResponse> {
        Ok(StatisticsResponse {
            request_id: buf.try_read_string()?,
            report: StatisticsReport::try_deser(buf)?,
        })
    }
}
