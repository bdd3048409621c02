//! Command line and environment configuration

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::engine::Capabilities;
use crate::rtmp::{PipelineConfig, VideoMode};
use crate::session::{SessionSettings, DEFAULT_MAX_PROBING_KBPS, DEFAULT_RTMP_BASE};
use crate::signaling::GatewayOptions;

/// WebRTC to RTMP bridge
///
/// Accepts one browser publisher per WebSocket connection and pushes its
/// media to `<rtmp base><stream key>`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the signaling server listens on
    #[arg(long, default_value = "0.0.0.0", env = "BRIDGE_BIND")]
    pub bind: IpAddr,

    /// Port the signaling server listens on
    #[arg(short, long, default_value_t = 8443, env = "BRIDGE_PORT")]
    pub port: u16,

    /// Path accepting WebSocket upgrades
    #[arg(long, default_value = "/magicmirror", env = "BRIDGE_PATH")]
    pub path: String,

    /// RTMP url the stream key is appended to
    #[arg(long, default_value = DEFAULT_RTMP_BASE, env = "RTMP_SERVER")]
    pub rtmp_base: String,

    /// Address advertised as ICE host candidate (default: first routable IPv4)
    #[arg(long, env = "BRIDGE_HOST_IP")]
    pub host_ip: Option<IpAddr>,

    /// Seconds between WebSocket pings
    #[arg(long, default_value_t = 30, env = "BRIDGE_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// Upper bound for bandwidth probing
    #[arg(long, default_value_t = DEFAULT_MAX_PROBING_KBPS, env = "BRIDGE_MAX_PROBING_KBPS")]
    pub max_probing_kbps: u32,

    /// How the video branch of the push pipeline treats H.264
    #[arg(long, value_enum, default_value_t = VideoMode::Passthrough, env = "BRIDGE_VIDEO_MODE")]
    pub video_mode: VideoMode,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn session_settings(&self) -> Arc<SessionSettings> {
        Arc::new(SessionSettings {
            rtmp_base: self.rtmp_base.clone(),
            capabilities: Capabilities::default(),
            max_probing_kbps: self.max_probing_kbps,
            pipeline: PipelineConfig {
                video: self.video_mode,
            },
        })
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            path: self.path.clone(),
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }
}
