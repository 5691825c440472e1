use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info};

use crate::config::endpoint::ClientConfiguration;
use crate::registration::challenge::ChallengeController;
use crate::registration::payload::RegistrationPayload;
use crate::rpc::{ClientCallback, RegistrationKind, ServerEndpoint};
use crate::transport::config::TransportConfiguration;

/// Client side of the registration protocol.
pub struct ClientRegistrationController {
    challenge: Arc<dyn ChallengeController>,
}

impl ClientRegistrationController {
    pub fn new(challenge: Arc<dyn ChallengeController>) -> ClientRegistrationController {
        ClientRegistrationController {
            challenge,
        }
    }

    fn payload(&self, config: &ClientConfiguration) -> RegistrationPayload {
        RegistrationPayload {
            client_configuration: config.clone(),
            evidence: self.challenge.create_evidence(config.id()),
        }
    }

    /// Returns the transport configuration the server dictates for this connection.
    pub async fn register(&self, endpoint: &dyn ServerEndpoint, config: &ClientConfiguration, callback: Arc<dyn ClientCallback>) -> anyhow::Result<TransportConfiguration> {
        debug!("registering client {:?}", config.id());
        let mut response = endpoint.registration_channel(RegistrationKind::Register, self.payload(config).to_bytes(), callback).await?;

        let transport_config = TransportConfiguration::try_deser(&mut response)
            .map_err(|e| anyhow!("invalid registration response: {}", e))?;
        info!("client {:?} registered with server {:?}", config.id(), transport_config.server_id);
        Ok(transport_config)
    }

    pub async fn unregister(&self, endpoint: &dyn ServerEndpoint, config: &ClientConfiguration, callback: Arc<dyn ClientCallback>) -> anyhow::Result<()> {
        debug!("unregistering client {:?}", config.id());
        endpoint.registration_channel(RegistrationKind::Unregister, self.payload(config).to_bytes(), callback).await?;
        Ok(())
    }
}
