use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::endpoint::{ClientConfiguration, ServerConfiguration};
use crate::messaging::envelope::TransportEnvelope;
use crate::messaging::message::{Message, STATISTICS_REQUEST_TYPE, STATISTICS_RESPONSE_TYPE};
use crate::messaging::message_bus::MessageBus;
use crate::server::registry::{Session, SessionRegistry};
use crate::server::routing::{internal_candidate, should_deliver};
use crate::transport::config::TransportConfiguration;
use crate::transport::controller::TransportController;
use crate::transport::statistics::{StatisticsReport, StatisticsResponse, TransportStatistics};

/// The server's routing core while it is running: relays envelopes to registered clients and
///  to the server's internal endpoint.
pub struct Relay {
    server_config: ServerConfiguration,
    internal: ClientConfiguration,
    registry: Arc<SessionRegistry>,
    /// decodes and re-encodes headers of relayed envelopes, counts relay traffic
    relay_transport: TransportController,
    /// the server's own endpoint: reassembles messages addressed to the server
    internal_transport: TransportController,
    bus: Arc<MessageBus>,
}

impl Relay {
    pub fn new(server_config: ServerConfiguration, transport_config: TransportConfiguration, registry: Arc<SessionRegistry>, bus: Arc<MessageBus>) -> anyhow::Result<Relay> {
        let server_id = server_config.id().to_string();
        Ok(Relay {
            internal: internal_candidate(&server_config),
            server_config,
            registry,
            relay_transport: TransportController::new(transport_config.clone(), Some(server_id))?,
            internal_transport: TransportController::new(transport_config, None)?,
            bus,
        })
    }

    pub fn server_id(&self) -> &str {
        self.server_config.id()
    }

    /// Publishes a message on behalf of the server's internal endpoint.
    pub async fn publish(self: &Arc<Self>, message: &Message) -> anyhow::Result<()> {
        for envelope in self.internal_transport.prepare_for_transport(message).await? {
            self.route(envelope).await;
        }
        Ok(())
    }

    /// Fans an envelope out to every receiver the routing rules select. Clients whose callback
    ///  fails are removed from the registry once the whole fan-out is done.
    ///
    /// NB: boxed because answering a statistics request routes the response from within a
    ///  routing pass
    pub fn route(self: &Arc<Self>, envelope: TransportEnvelope) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let relay = self.clone();
        Box::pin(async move {
            relay.do_route(envelope).await
        })
    }

    async fn do_route(self: &Arc<Self>, envelope: TransportEnvelope) {
        let mut header = match self.relay_transport.decode_header(&envelope.header) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping envelope with undecodable header: {:#}", e);
                return;
            }
        };
        self.relay_transport.record_incoming_envelope(&envelope).await;

        if header.has_passed_server(self.server_id()) {
            debug!("dropping {:?}: already relayed by this server", header);
            return;
        }
        header.server_ids.push(self.server_id().to_string());

        let relayed = match self.relay_transport.encode_header(&header) {
            Ok(encoded) => TransportEnvelope {
                header: encoded,
                payload: envelope.payload,
            },
            Err(e) => {
                warn!("error re-encoding header of {:?}: {:#}", header, e);
                return;
            }
        };

        let mut deliveries = JoinSet::new();
        for session in self.registry.snapshot().await {
            if !should_deliver(&header, &session.config, &self.server_config) {
                continue;
            }
            trace!("delivering {:?} to {:?}", header, session.id());

            let relay = self.clone();
            let envelope = relayed.clone();
            deliveries.spawn(async move {
                match session.handle.callback.push_envelope_to_client(envelope.clone()).await {
                    Ok(()) => {
                        session.touch();
                        relay.relay_transport.record_outgoing_envelope(&envelope).await;
                        None
                    }
                    Err(e) => {
                        warn!("error delivering to client {:?}: {:#}", session.id(), e);
                        Some(session)
                    }
                }
            });
        }

        if should_deliver(&header, &self.internal, &self.server_config) {
            self.deliver_internally(&relayed).await;
        }

        let mut failed = Vec::new();
        while let Some(result) = deliveries.join_next().await {
            match result {
                Ok(Some(session)) => failed.push(session),
                Ok(None) => {}
                Err(e) => warn!("delivery task failed: {}", e),
            }
        }
        self.prune(failed).await;
    }

    async fn prune(&self, failed: Vec<Arc<Session>>) {
        if failed.is_empty() {
            return;
        }
        let removed = self.registry.remove_all(&failed).await;
        warn!("removed {} unreachable client(s) from the registry", removed);
    }

    async fn deliver_internally(self: &Arc<Self>, envelope: &TransportEnvelope) {
        let message = match self.internal_transport.ingest_fragment(envelope).await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                warn!("error receiving envelope at the server's endpoint: {:#}", e);
                return;
            }
        };

        if message.type_info() == STATISTICS_REQUEST_TYPE {
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.answer_statistics_request(&message).await {
                    warn!("error answering statistics request {:?}: {:#}", message.id(), e);
                }
            });
        }
        else if message.type_info() == STATISTICS_RESPONSE_TYPE {
            debug!("ignoring statistics response addressed to the server");
        }
        else {
            self.bus.publish(message);
        }
    }

    async fn answer_statistics_request(self: &Arc<Self>, request: &Message) -> anyhow::Result<()> {
        let response = StatisticsResponse {
            request_id: request.id().to_string(),
            report: self.statistics_report().await,
        };
        let mut buf = BytesMut::new();
        response.ser(&mut buf);

        let message = Message::internal(self.server_id(), request.client_id(), STATISTICS_RESPONSE_TYPE, buf.freeze())?;
        self.publish(&message).await
    }

    pub async fn statistics_report(&self) -> StatisticsReport {
        StatisticsReport {
            server: self.relay_transport.statistics().await,
            internal_client: self.internal_transport.statistics().await,
            clients: request_clients_statistics(&self.registry).await,
        }
    }

    pub async fn relay_statistics(&self) -> TransportStatistics {
        self.relay_transport.statistics().await
    }
}

/// Asks every registered client for its statistics concurrently; clients that fail to answer
///  are left out.
pub async fn request_clients_statistics(registry: &SessionRegistry) -> BTreeMap<String, TransportStatistics> {
    let mut requests = JoinSet::new();
    for session in registry.snapshot().await {
        requests.spawn(async move {
            let result = session.handle.callback.get_statistics().await
                .and_then(|mut raw| TransportStatistics::try_deser(&mut raw));
            (session.id().to_string(), result)
        });
    }

    let mut result = BTreeMap::new();
    while let Some(joined) = requests.join_next().await {
        match joined {
            Ok((id, Ok(stats))) => {
                result.insert(id, stats);
            }
            Ok((id, Err(e))) => warn!("error requesting statistics from client {:?}: {:#}", id, e),
            Err(e) => warn!("statistics request task failed: {}", e),
        }
    }
    result
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use bytes::Bytes;
    use crate::rpc::RecipientHandle;
    use crate::test_util::{test_client_config, TrackingClientCallback};
    use super::*;

    struct Fixture {
        relay: Arc<Relay>,
        bus: Arc<MessageBus>,
        registry: Arc<SessionRegistry>,
        sender: TransportController,
    }

    fn fixture() -> Fixture {
        let mut server_config = ServerConfiguration::new("s1");
        server_config.override_types_filter.insert("alert".to_string());
        let transport_config = TransportConfiguration::new("s1");

        let registry = Arc::new(SessionRegistry::new());
        let bus = Arc::new(MessageBus::default());
        Fixture {
            relay: Arc::new(Relay::new(server_config, transport_config.clone(), registry.clone(), bus.clone()).unwrap()),
            bus,
            registry,
            sender: TransportController::new(transport_config, None).unwrap(),
        }
    }

    async fn register(registry: &SessionRegistry, config: ClientConfiguration, callback: Arc<TrackingClientCallback>) {
        let handle = RecipientHandle::new(config.id(), callback);
        registry.upsert(Session::new(config, handle)).await;
    }

    impl Fixture {
        async fn route(&self, message: &Message) {
            for envelope in self.sender.prepare_for_transport(message).await.unwrap() {
                self.relay.route(envelope).await;
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast() {
        let f = fixture();
        let a = TrackingClientCallback::new();
        let b = TrackingClientCallback::new();
        let c = TrackingClientCallback::new();
        register(&f.registry, test_client_config("a", false, &[]), a.clone()).await;
        register(&f.registry, test_client_config("b", false, &[]), b.clone()).await;
        register(&f.registry, test_client_config("c", false, &["other"]), c.clone()).await;

        let mut server_messages = f.bus.subscribe();
        f.route(&Message::with_id("m1", "a", "t", b"x".to_vec()).unwrap()).await;

        assert!(a.received_envelopes().await.is_empty());
        assert!(c.received_envelopes().await.is_empty());

        let received = b.received_envelopes().await;
        assert_eq!(received.len(), 1);
        let header = f.sender.decode_header(&received[0].header).unwrap();
        assert_eq!(header.server_ids, vec!["s1".to_string()]);

        assert_eq!(server_messages.try_recv().unwrap().id(), "m1");
    }

    #[tokio::test]
    async fn test_override_and_target() {
        let f = fixture();
        let a = TrackingClientCallback::new();
        let b = TrackingClientCallback::new();
        register(&f.registry, test_client_config("a", false, &["nothing"]), a.clone()).await;
        register(&f.registry, test_client_config("b", false, &[]), b.clone()).await;

        f.route(&Message::with_id("m1", "c", "t", b"x".to_vec()).unwrap().targeted_at("b")).await;
        assert!(a.received_envelopes().await.is_empty());
        assert_eq!(b.received_envelopes().await.len(), 1);

        f.route(&Message::with_id("m2", "c", "alert", b"x".to_vec()).unwrap().targeted_at("b")).await;
        assert_eq!(a.received_envelopes().await.len(), 1);
        assert_eq!(b.received_envelopes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_already_relayed_is_dropped() {
        let f = fixture();
        let b = TrackingClientCallback::new();
        register(&f.registry, test_client_config("b", false, &[]), b.clone()).await;

        let mut msg = Message::with_id("m1", "a", "t", b"x".to_vec()).unwrap();
        msg.append_server_id("s0");
        msg.append_server_id("s1");
        f.route(&msg).await;

        assert!(b.received_envelopes().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_clients_are_pruned() {
        let f = fixture();
        let good = TrackingClientCallback::new();
        register(&f.registry, test_client_config("good", false, &[]), good.clone()).await;
        register(&f.registry, test_client_config("bad", false, &[]), TrackingClientCallback::failing()).await;

        f.route(&Message::with_id("m1", "a", "t", b"x".to_vec()).unwrap()).await;

        assert_eq!(good.received_envelopes().await.len(), 1);
        assert!(f.registry.get("bad").await.is_none());
        assert!(f.registry.get("good").await.is_some());
        assert_eq!(f.relay.relay_statistics().await.outgoing_envelopes, 1);
    }

    #[tokio::test]
    async fn test_statistics_request_is_answered() {
        let f = fixture();
        let a = TrackingClientCallback::new();
        register(&f.registry, test_client_config("a", false, &[]), a.clone()).await;

        let request = Message::internal("a", "s1", STATISTICS_REQUEST_TYPE, Bytes::new()).unwrap();
        f.route(&request).await;

        let mut received = Vec::new();
        for _ in 0..100 {
            received = a.received_envelopes().await;
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.len(), 1);

        let receiver = TransportController::new(TransportConfiguration::new("s1"), None).unwrap();
        let response = receiver.ingest_fragment(&received[0]).await.unwrap().unwrap();
        assert_eq!(response.type_info(), STATISTICS_RESPONSE_TYPE);
        assert_eq!(response.target_id(), "a");

        let response = StatisticsResponse::try_deser(&mut response.payload().clone()).unwrap();
        assert_eq!(response.request_id, request.id());
        assert!(response.report.clients.contains_key("a"));
    }
}
