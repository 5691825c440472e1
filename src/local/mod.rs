//! In-process binding: clients and server live in the same process and call each other
//!  directly through the RPC traits.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use crate::channel::Channel;
use crate::rpc::{Connector, ServerEndpoint};
use crate::server::server::Server;

pub struct LocalConnector {
    server: Arc<Server>,
}

impl LocalConnector {
    pub fn new(server: Arc<Server>) -> LocalConnector {
        LocalConnector {
            server,
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ServerEndpoint>> {
        if !self.server.is_accepting() {
            bail!("server {:?} is not accepting connections (state {:?})", self.server.id(), self.server.state());
        }
        debug!("connecting in-process to server {:?}", self.server.id());
        Ok(self.server.endpoint())
    }
}
