//! Command-line argument parsing.

use clap::Parser;

/// hyperk Node Daemon - VM provisioning and lifecycle service
#[derive(Parser, Debug, Default)]
#[command(name = "hyperk-node")]
#[command(about = "hyperk Node Daemon - VM provisioning and lifecycle service")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "HYPERK_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Listen address for the REST API
    #[arg(long)]
    pub listen: Option<String>,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long)]
    pub libvirt_uri: Option<String>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "hyperk-node",
            "--config", "/tmp/node.yaml",
            "--log-level", "debug",
            "--listen", "127.0.0.1:9000",
            "--dev",
        ]);
        assert_eq!(args.config.as_deref(), Some("/tmp/node.yaml"));
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:9000"));
        assert!(args.dev);
        assert!(!args.log_json);
        assert!(args.libvirt_uri.is_none());
    }
}
