//! Edge command handler.

use askq_core::{config::AppConfig, AppResult};
use askq_dispatch::shutdown;
use askq_edge::{EdgeServer, GatewayApi, HttpGatewayClient};
use clap::Args;
use std::sync::Arc;

use super::{join_all, shutdown_on_ctrl_c};

/// Run the edge API in front of a gateway
#[derive(Args, Debug)]
pub struct EdgeCommand {
    /// Listen address (overrides edge.listenAddr)
    #[arg(long)]
    pub listen: Option<String>,

    /// Gateway base URL (overrides edge.gatewayUrl)
    #[arg(long)]
    pub gateway_url: Option<String>,
}

impl EdgeCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing edge command");
        tracing::debug!("Edge options: {:?}", self);

        let mut settings = config.edge.clone();
        if let Some(listen) = &self.listen {
            settings.listen_addr = listen.clone();
        }
        if let Some(url) = &self.gateway_url {
            settings.gateway_url = url.clone();
        }

        let gateway: Arc<dyn GatewayApi> = Arc::new(HttpGatewayClient::new(&settings.gateway_url)?);
        tracing::info!("Forwarding to gateway at {}", settings.gateway_url);

        let tx = shutdown::channel();
        shutdown_on_ctrl_c(tx.clone());

        let server = EdgeServer::new(settings, gateway, tx.clone())?;
        let pump = server.start_pump();
        let result = server.run().await;

        let _ = tx.send(());
        join_all(vec![pump]).await;
        result
    }
}
