use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::registration::challenge::ChallengeController;
use crate::registration::payload::RegistrationPayload;
use crate::rpc::{ClientCallback, RecipientHandle, RegistrationKind};
use crate::server::registry::{Session, SessionRegistry};
use crate::transport::config::TransportConfiguration;

/// Server side of the registration protocol: admits clients into the session registry, and
///  owns the live transport configuration that is handed to every registering client.
pub struct ServerRegistrationController {
    challenge: Arc<dyn ChallengeController>,
    registry: Arc<SessionRegistry>,
    transport_config: RwLock<TransportConfiguration>,
}

impl ServerRegistrationController {
    pub fn new(challenge: Arc<dyn ChallengeController>, registry: Arc<SessionRegistry>, transport_config: TransportConfiguration) -> ServerRegistrationController {
        ServerRegistrationController {
            challenge,
            registry,
            transport_config: RwLock::new(transport_config),
        }
    }

    pub async fn transport_config(&self) -> TransportConfiguration {
        self.transport_config.read().await.clone()
    }

    /// Applies to clients registering from now on. Sessions that already exist keep the
    ///  configuration they registered with until they reconnect.
    pub async fn update_transport_config(&self, config: TransportConfiguration) -> anyhow::Result<()> {
        config.validate()?;
        *self.transport_config.write().await = config;
        Ok(())
    }

    pub async fn handle(&self, kind: RegistrationKind, mut data: Bytes, callback: Arc<dyn ClientCallback>) -> anyhow::Result<Bytes> {
        let payload = RegistrationPayload::try_deser(&mut data)?;
        let client_config = payload.client_configuration;
        client_config.validate()?;

        if let Err(e) = self.challenge.validate_evidence(client_config.id(), &payload.evidence) {
            warn!("rejecting {:?} for client {:?}: {}", kind, client_config.id(), e);
            return Err(e);
        }

        match kind {
            RegistrationKind::Register => {
                let handle = RecipientHandle::new(client_config.id(), callback);
                let client_id = client_config.id().to_string();
                self.registry.upsert(Session::new(client_config, handle)).await;
                info!("registered client {:?}", client_id);

                let mut buf = BytesMut::new();
                self.transport_config.read().await.ser(&mut buf);
                Ok(buf.freeze())
            }
            RegistrationKind::Unregister => {
                if self.registry.remove(client_config.id(), &callback).await.is_some() {
                    info!("unregistered client {:?}", client_config.id());
                }
                else {
                    warn!("unregistering client {:?} that is not registered through this connection", client_config.id());
                }
                Ok(Bytes::new())
            }
        }
    }
}
