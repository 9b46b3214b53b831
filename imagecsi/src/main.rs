//! imagecsi - image volume CSI node plugin.
//!
//! Serves the CSI Identity and Node services over QUIC and publishes
//! container images into Pods as read-only volumes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use libimagecsi::transport::server::CsiServer;
use libimagecsi::transport::tls;
use libimagecsi::{ImageBackend, ImageDriverConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Image volume CSI node plugin
#[derive(Parser, Debug)]
#[command(name = "imagecsi", version, about = "Image volume CSI node plugin")]
struct Args {
    /// Address the QUIC endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// PEM certificate chain presented to clients.
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key matching `--cert`.
    #[arg(long)]
    key: PathBuf,

    /// Store root; overrides IMAGECSI_ROOT.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Kubelet pods directory; overrides IMAGECSI_PODS_DIR.
    #[arg(long)]
    pods_dir: Option<String>,

    /// Node identifier; overrides IMAGECSI_NODE_ID.
    #[arg(long)]
    node_id: Option<String>,

    /// Per-command timeout in seconds, 0 for none; overrides IMAGECSI_TIMEOUT_SECS.
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn driver_config(&self) -> ImageDriverConfig {
        let mut cfg = ImageDriverConfig::from_env();
        if let Some(root) = &self.root {
            cfg.root = root.clone();
        }
        if let Some(pods_dir) = &self.pods_dir {
            cfg.pods_dir = pods_dir.clone();
        }
        if let Some(node_id) = &self.node_id {
            cfg.node_id = node_id.clone();
        }
        if let Some(secs) = self.timeout_secs {
            cfg.command_timeout = Some(Duration::from_secs(secs)).filter(|t| !t.is_zero());
        }
        cfg
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if !nix::unistd::Uid::effective().is_root() {
        warn!("not running as root; publishing into kubelet directories will likely fail");
    }

    let cfg = args.driver_config();
    info!(
        listen = %args.listen,
        root = %cfg.root.display(),
        pods_dir = %cfg.pods_dir,
        node_id = %cfg.node_id,
        timeout = ?cfg.command_timeout,
        "starting image CSI node plugin"
    );

    let chain = tls::load_certs(&args.cert).context("failed to load TLS certificate")?;
    let key = tls::load_key(&args.key).context("failed to load TLS private key")?;
    let tls_config = tls::server_config(chain, key).context("failed to build TLS config")?;

    let backend = Arc::new(ImageBackend::from_config(&cfg));
    let server = CsiServer::new(args.listen, tls_config, backend)
        .context("failed to bind CSI endpoint")?;

    tokio::select! {
        res = server.serve() => res.context("CSI server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.endpoint().close(0u32.into(), b"shutdown");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_driver_config() {
        let args = Args::parse_from([
            "imagecsi",
            "--cert",
            "/etc/imagecsi/node.crt",
            "--key",
            "/etc/imagecsi/node.key",
            "--root",
            "/srv/images",
            "--node-id",
            "worker-3",
            "--timeout-secs",
            "0",
            "--log-format",
            "json",
        ]);
        let cfg = args.driver_config();
        assert_eq!(cfg.root, PathBuf::from("/srv/images"));
        assert_eq!(cfg.node_id, "worker-3");
        assert!(cfg.command_timeout.is_none());
        assert!(matches!(args.log_format, LogFormat::Json));
    }

    #[test]
    fn cert_and_key_are_required() {
        assert!(Args::try_parse_from(["imagecsi"]).is_err());
    }
}
