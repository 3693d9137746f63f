use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;
use websink_rtc::{normalize_ice_url, RtcConfig, VideoCodec, DEFAULT_STUN_SERVER};
use websink_signaling::SignalingConfig;

#[derive(Debug, Parser)]
#[command(
    name = "websink",
    author,
    version,
    about = "Serve a live WebRTC video stream to browser viewers"
)]
pub struct Cli {
    /// Interface both listeners bind to.
    #[arg(long, env = "WEBSINK_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port for the config, health and metrics endpoints. 0 picks any free port.
    #[arg(long, env = "WEBSINK_HTTP_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Port for the WebSocket signaling endpoint. 0 picks any free port.
    #[arg(long, env = "WEBSINK_WS_PORT", default_value_t = 8081)]
    pub ws_port: u16,

    /// STUN server handed to every peer connection. Empty disables it.
    #[arg(long, env = "WEBSINK_STUN_SERVER", default_value = DEFAULT_STUN_SERVER)]
    pub stun_server: String,

    /// Codec of the outbound video track: vp8 or h264.
    #[arg(long, env = "WEBSINK_VIDEO_CODEC", default_value = "vp8")]
    pub video_codec: String,

    /// Time a viewer has for each handshake step.
    #[arg(long, env = "WEBSINK_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Grace period applied after all viewers are closed.
    #[arg(long, env = "WEBSINK_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Directory holding the viewer page.
    #[arg(long, env = "WEBSINK_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub ws_port: u16,
    pub rtc: RtcConfig,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub static_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            handshake_timeout: self.handshake_timeout,
        }
    }
}

impl TryFrom<Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let bind_address: IpAddr = cli
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address: {}", cli.bind_address))?;
        let video_codec: VideoCodec = cli
            .video_codec
            .parse()
            .context("invalid --video-codec")?;
        ensure!(
            cli.handshake_timeout_secs > 0,
            "handshake timeout must be at least one second"
        );
        if let Some(dir) = &cli.static_dir {
            ensure!(
                dir.is_dir(),
                "static directory {} does not exist",
                dir.display()
            );
        }

        let stun = cli.stun_server.trim();
        let ice_servers = if stun.is_empty() {
            Vec::new()
        } else {
            vec![normalize_ice_url(stun)]
        };

        Ok(AppConfig {
            bind_address,
            http_port: cli.port,
            ws_port: cli.ws_port,
            rtc: RtcConfig {
                ice_servers,
                video_codec,
            },
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            static_dir: cli.static_dir,
        })
    }
}
