use std::net::SocketAddr;
use std::path::PathBuf;

use crate::app::Cli;
use crate::ingest::IngestConfig;
use crate::prelude::*;
use crate::store::StoreMode;

/// Validated runtime configuration, built from the command line and its environment
/// fallbacks.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub web_addr: SocketAddr,
    pub ingest_addr: SocketAddr,
    pub logs_dir: PathBuf,
    pub store_mode: StoreMode,
    pub ingest: IngestConfig,
}

impl TryFrom<&Cli> for ServerConfig {
    type Error = Error;

    fn try_from(cli: &Cli) -> Result<Self> {
        if cli.max_frame_bytes == 0 {
            bail!("--max-frame-bytes must be greater than 0");
        }
        if cli.logs_dir.as_os_str().is_empty() {
            bail!("--logs-dir must not be empty");
        }
        if cli.web_addr == cli.ingest_addr && cli.web_addr.port() != 0 {
            bail!(
                "The web server and the ingest server cannot both listen on {}",
                cli.web_addr
            );
        }

        let store_mode = if cli.keep_logs {
            StoreMode::Reuse
        } else {
            StoreMode::Reset
        };

        Ok(Self {
            web_addr: cli.web_addr,
            ingest_addr: cli.ingest_addr,
            logs_dir: cli.logs_dir.clone(),
            store_mode,
            ingest: IngestConfig {
                max_frame_len: cli.max_frame_bytes,
                ..IngestConfig::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DEFAULT_MAX_FRAME_LEN;
    use clap::Parser;
    use proctree_shared::protocol::{DEFAULT_INGEST_PORT, DEFAULT_WEB_PORT};

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let cli =
            Cli::try_parse_from(std::iter::once("proctree-server").chain(args.iter().copied()))?;
        ServerConfig::try_from(&cli)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();

        assert_eq!(config.web_addr.port(), DEFAULT_WEB_PORT);
        assert_eq!(config.ingest_addr.port(), DEFAULT_INGEST_PORT);
        assert!(config.ingest_addr.ip().is_loopback());
        assert_eq!(config.logs_dir, PathBuf::from("logs"));
        assert_eq!(config.store_mode, StoreMode::Reset);
        assert_eq!(config.ingest.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--web-addr",
            "127.0.0.1:8080",
            "--ingest-addr",
            "127.0.0.1:7070",
            "--logs-dir",
            "/tmp/proctree",
            "--max-frame-bytes",
            "4096",
            "--keep-logs",
        ])
        .unwrap();

        assert_eq!(config.web_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.ingest_addr, "127.0.0.1:7070".parse().unwrap());
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/proctree"));
        assert_eq!(config.store_mode, StoreMode::Reuse);
        assert_eq!(config.ingest.max_frame_len, 4096);
    }

    #[test]
    fn test_zero_frame_limit_is_rejected() {
        let err = parse(&["--max-frame-bytes", "0"]).unwrap_err();
        assert!(err.to_string().contains("--max-frame-bytes"), "{err}");
    }

    #[test]
    fn test_same_address_for_both_servers_is_rejected() {
        let err = parse(&[
            "--web-addr",
            "127.0.0.1:9000",
            "--ingest-addr",
            "127.0.0.1:9000",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:9000"), "{err}");
    }
}
