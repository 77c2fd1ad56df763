use clap::Parser;
use std::num::ParseIntError;
use std::str::FromStr;
use std::{net::SocketAddr, path::PathBuf};

#[derive(Parser, Debug, Clone)]
#[command(about = "Replicated commit log daemon")]
pub struct Opts {
    /// Id of this node, unique within the cluster
    #[arg(long = "id", env = "REPLOGD_ID", default_value = "0")]
    pub id: u64,

    #[arg(long = "data-dir", env = "REPLOGD_DATA_DIR", default_value = "/var/lib/replogd")]
    pub data_dir: PathBuf,

    /// Listen for clients and peers on this address
    #[arg(long = "bind", env = "REPLOGD_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Address other nodes and clients should use (default: bind address)
    #[arg(long = "advertise", env = "REPLOGD_ADVERTISE")]
    pub advertise: Option<String>,

    /// Start a new cluster with this node as the only member
    #[arg(long = "bootstrap")]
    pub bootstrap: bool,

    /// Join the cluster the node at this address belongs to
    #[arg(long = "join", env = "REPLOGD_JOIN", conflicts_with = "bootstrap")]
    pub join: Option<String>,

    /// Join as a non-voting member
    #[arg(long = "non-voter", requires = "join")]
    pub non_voter: bool,

    /// Directory with certificates and ACL files (default: `$HOME/.replog`)
    #[arg(long = "config-dir", env = "CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Require mutual TLS on all connections
    #[arg(long = "tls")]
    pub tls: bool,

    /// Authorize requests using the ACL files
    #[arg(long = "acl")]
    pub acl: bool,

    #[arg(long = "max-store-bytes", value_parser = parse_byte_unit)]
    pub max_store_bytes: Option<u64>,

    #[arg(long = "max-index-bytes", value_parser = parse_byte_unit)]
    pub max_index_bytes: Option<u64>,

    /// Drop the oldest records once the log is larger than that (e.g. `10g`)
    #[arg(long = "max-log-bytes", env = "REPLOGD_MAX_LOG_BYTES", value_parser = parse_byte_unit)]
    pub max_log_bytes: Option<u64>,

    /// Compact the replication log after that many applied entries
    #[arg(long = "snapshot-threshold")]
    pub snapshot_threshold: Option<u64>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

fn parse_byte_unit(s: &str) -> std::result::Result<u64, ParseIntError> {
    let s = s.trim().to_lowercase();

    Ok(if let Some(num) = s.strip_suffix('k') {
        u64::from_str(num)? * 1024
    } else if let Some(num) = s.strip_suffix('m') {
        u64::from_str(num)? * 1024 * 1024
    } else if let Some(num) = s.strip_suffix('g') {
        u64::from_str(num)? * 1024 * 1024 * 1024
    } else {
        u64::from_str(&s)?
    })
}

#[test]
fn parse_byte_unit_test() {
    assert_eq!(parse_byte_unit("0"), Ok(0));
    assert_eq!(parse_byte_unit("2000"), Ok(2000));
    assert_eq!(parse_byte_unit("12k"), Ok(12 * 1024));
    assert_eq!(parse_byte_unit("16M"), Ok(16 * 1024 * 1024));
    assert_eq!(parse_byte_unit(" 1g "), Ok(1024 * 1024 * 1024));
    assert!(parse_byte_unit("m").is_err());
    assert!(parse_byte_unit("1w").is_err());
}

#[test]
fn join_conflicts_with_bootstrap() {
    assert!(Opts::try_parse_from(["replogd", "--bootstrap", "--join", "10.0.0.1:8080"]).is_err());
    let opts = Opts::try_parse_from(["replogd", "--id", "2", "--join", "10.0.0.1:8080"])
        .expect("valid args");
    assert_eq!(opts.id, 2);
    assert_eq!(opts.join.as_deref(), Some("10.0.0.1:8080"));
    assert_eq!(opts.max_log_bytes, None);

    let opts = Opts::try_parse_from(["replogd", "--max-log-bytes", "2g"]).expect("valid args");
    assert_eq!(opts.max_log_bytes, Some(2 * 1024 * 1024 * 1024));
}
