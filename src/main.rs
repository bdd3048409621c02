use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use webrtc_rtmp_bridge::config::Config;
use webrtc_rtmp_bridge::engine::rtc::RtcEngine;
use webrtc_rtmp_bridge::rtmp;
use webrtc_rtmp_bridge::signaling::Gateway;
use webrtc_rtmp_bridge::util::select_host_address;

fn init_log() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_log();

    let host = config
        .host_ip
        .or_else(select_host_address)
        .ok_or_else(|| anyhow!("no routable interface found, set --host-ip"))?;
    info!("Advertising {} as ICE host candidate", host);

    let engine = Arc::new(RtcEngine::new(host));
    let pipelines = rtmp::default_backend().context("pipeline backend")?;
    let gateway = Arc::new(Gateway::new(
        engine,
        pipelines,
        config.session_settings(),
        config.gateway_options(),
    ));
    let shutdown = gateway.shutdown_handle();

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;

    #[cfg(unix)]
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = webrtc_rtmp_bridge::signaling::forward_broken_pipe(shutdown).await {
                warn!("Can't listen for SIGPIPE: {}", e);
            }
        });
    }

    tokio::select! {
        res = gateway.serve(listener) => {
            if let Err(e) = &res {
                error!("Signaling server failed: {}", e);
            }
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            info!("Ctrl-C received, closing sessions");
            if shutdown.send(()).is_err() {
                info!("No open sessions");
            }
            // Give connection tasks a moment to tear down their pipelines.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    Ok(())
}
