//! Gateway command handler.
//!
//! Runs the dispatch gateway: HTTP service, response fan-in and reclaimer.

use askq_core::{config::AppConfig, AppResult};
use askq_dispatch::{shutdown, DispatchGateway, GatewayConfig, GatewayServer};
use clap::Args;

use super::{join_all, open_queue, shutdown_on_ctrl_c};

/// Run the dispatch gateway
#[derive(Args, Debug)]
pub struct GatewayCommand {
    /// Listen address (overrides gateway.listenAddr)
    #[arg(long)]
    pub listen: Option<String>,
}

impl GatewayCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing gateway command");
        tracing::debug!("Gateway options: {:?}", self);

        let listen = self
            .listen
            .clone()
            .unwrap_or_else(|| config.gateway.listen_addr.clone());

        let queue = open_queue(config)?;
        let gateway = DispatchGateway::new(queue, GatewayConfig::from(config));

        let tx = shutdown::channel();
        shutdown_on_ctrl_c(tx.clone());
        let handles = gateway.start_background(&tx)?;

        let server = GatewayServer::new(gateway, config.gateway.keepalive(), tx.clone());
        let result = server.run(&listen).await;

        // Stop the background loops even if the server failed to start
        let _ = tx.send(());
        join_all(handles).await;
        result
    }
}
