//! Configuration for aetherd

use crate::store::StoreBackend;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// aetherd - Aether relay daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "aetherd")]
#[command(about = "Content-addressed pub/sub relay for autonomous agents")]
pub struct Config {
    /// Native gateway listen address (WebSocket)
    #[arg(long, default_value = "0.0.0.0:7070", env = "AETHER_LISTEN")]
    pub listen: SocketAddr,

    /// Native gateway QUIC listen address (requires TLS material)
    #[arg(long, default_value = "0.0.0.0:7070", env = "AETHER_QUIC_LISTEN")]
    pub quic_listen: SocketAddr,

    /// NIP-01 adapter listen address (WebSocket)
    #[arg(long, default_value = "0.0.0.0:7071", env = "AETHER_NIP01_LISTEN")]
    pub nip01_listen: SocketAddr,

    /// HTTP adapter listen address
    #[arg(long, default_value = "0.0.0.0:7080", env = "AETHER_HTTP_LISTEN")]
    pub http_listen: SocketAddr,

    /// Storage backend: `memory`, `sled:<path>`, or `sqlite:<path>`
    #[arg(long, default_value = "memory", env = "AETHER_STORE")]
    pub store: String,

    /// TLS certificate chain (PEM). Together with --tls-key this
    /// enables the QUIC listener; missing material disables QUIC but
    /// not WebSocket.
    #[arg(long, env = "AETHER_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "AETHER_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Disable the NIP-01 adapter
    #[arg(long, env = "AETHER_NO_NIP01")]
    pub no_nip01: bool,

    /// Disable the HTTP adapter
    #[arg(long, env = "AETHER_NO_HTTP")]
    pub no_http: bool,

    /// Require the transport-encryption upgrade on the native gateway
    #[arg(long, env = "AETHER_NOISE_REQUIRED")]
    pub noise_required: bool,

    /// TTL for immutable events in seconds (0 keeps them forever)
    #[arg(long, default_value = "0", env = "AETHER_TTL_SECS")]
    pub ttl_secs: u64,

    /// GC sweep interval in seconds
    #[arg(long, default_value = "3600")]
    pub gc_interval_secs: u64,

    /// Maximum tolerated future clock skew in seconds
    #[arg(long, default_value = "60", env = "AETHER_MAX_SKEW_SECS")]
    pub max_skew_secs: u64,

    /// Minimum event-id proof-of-work difficulty in bits (0 disables)
    #[arg(long, default_value = "0", env = "AETHER_MIN_POW_BITS")]
    pub min_pow_bits: u32,

    /// Per-subscription outbound queue capacity
    #[arg(long, default_value = "1024")]
    pub outbox_capacity: usize,

    /// Per-pubkey publish limit in events per minute (0 = unlimited)
    #[arg(long, default_value = "0", env = "AETHER_RATE_LIMIT_EPM")]
    pub rate_limit_epm: u32,

    /// HELLO handshake deadline in seconds
    #[arg(long, default_value = "10")]
    pub hello_timeout_secs: u64,

    /// Keepalive ping interval for idle connections, in seconds
    #[arg(long, default_value = "30")]
    pub ping_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Parse the storage backend selector.
    pub fn store_backend(&self) -> anyhow::Result<StoreBackend> {
        if self.store == "memory" {
            return Ok(StoreBackend::Memory);
        }
        if let Some(path) = self.store.strip_prefix("sled:") {
            if path.is_empty() {
                anyhow::bail!("sled backend needs a path");
            }
            return Ok(StoreBackend::Sled(PathBuf::from(path)));
        }
        if let Some(path) = self.store.strip_prefix("sqlite:") {
            if path.is_empty() {
                anyhow::bail!("sqlite backend needs a path");
            }
            return Ok(StoreBackend::Sqlite(PathBuf::from(path)));
        }
        anyhow::bail!("unknown storage backend: {:?}", self.store)
    }

    /// QUIC runs only when both halves of the TLS material are present.
    pub fn quic_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn ttl_ns(&self) -> u64 {
        self.ttl_secs.saturating_mul(1_000_000_000)
    }

    /// Validate configuration; failures map to exit code 64.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.store_backend()?;
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("--tls-cert and --tls-key must be provided together");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("log format must be json or pretty");
        }
        if self.outbox_capacity == 0 {
            anyhow::bail!("outbox capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("aetherd").chain(args.iter().copied()))
    }

    #[test]
    fn backend_selectors_parse() {
        assert_eq!(config(&[]).store_backend().unwrap(), StoreBackend::Memory);
        assert_eq!(
            config(&["--store", "sled:/tmp/db"]).store_backend().unwrap(),
            StoreBackend::Sled(PathBuf::from("/tmp/db"))
        );
        assert_eq!(
            config(&["--store", "sqlite:/tmp/relay.db"])
                .store_backend()
                .unwrap(),
            StoreBackend::Sqlite(PathBuf::from("/tmp/relay.db"))
        );
        assert!(config(&["--store", "postgres:x"]).store_backend().is_err());
        assert!(config(&["--store", "sled:"]).store_backend().is_err());
    }

    #[test]
    fn tls_material_must_be_paired() {
        assert!(config(&["--tls-cert", "/tmp/c.pem"]).validate().is_err());
        assert!(config(&["--tls-cert", "/tmp/c.pem", "--tls-key", "/tmp/k.pem"])
            .validate()
            .is_ok());
        assert!(!config(&[]).quic_enabled());
    }

    #[test]
    fn defaults_validate() {
        let config = config(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl_ns(), 0);
        assert!(!config.no_http);
    }

    #[test]
    fn bad_knobs_fail_validation() {
        assert!(config(&["--log-format", "xml"]).validate().is_err());
        assert!(config(&["--outbox-capacity", "0"]).validate().is_err());
    }
}
