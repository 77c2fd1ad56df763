#![deny(clippy::as_conversions)]
use anyhow::{bail, Context};
use opts::Opts;
use replog_api::NodeId;
use replogd::auth::PolicyAuthorizer;
use replogd::config::ConfigFiles;
use replogd::tls::TlsParams;
use replogd::{NodeCtrl, Parameters, RaftParams};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

const JOIN_ATTEMPTS: usize = 30;
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let config_files = if opts.tls || opts.acl {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Some(ConfigFiles::resolve(opts.config_dir.as_deref(), home.as_deref())?)
    } else {
        None
    };

    let tls = match (&config_files, opts.tls) {
        (Some(files), true) => Some(TlsParams::load(files)?),
        _ => None,
    };

    let raft = if let Some(snapshot_threshold) = opts.snapshot_threshold {
        RaftParams::builder()
            .snapshot_threshold(snapshot_threshold)
            .build()
    } else {
        RaftParams::default()
    };

    let mut params = Parameters::builder()
        .id(NodeId(opts.id))
        .bind(opts.bind)
        .data_dir(opts.data_dir.clone())
        .bootstrap(opts.bootstrap)
        .max_store_bytes(
            opts.max_store_bytes
                .unwrap_or(replogd::log::LogConfig::DEFAULT_MAX_STORE_BYTES),
        )
        .max_index_bytes(
            opts.max_index_bytes
                .unwrap_or(replogd::log::LogConfig::DEFAULT_MAX_INDEX_BYTES),
        )
        .raft(raft)
        .build();
    params.advertise = opts.advertise.clone();
    params.max_log_bytes = opts.max_log_bytes;
    params.tls = tls.clone();
    if let (Some(files), true) = (&config_files, opts.acl) {
        params.authorizer = Arc::new(PolicyAuthorizer::load(
            &files.acl_model_file,
            &files.acl_policy_file,
        )?);
    }

    let node = replogd::Node::new(params)?;

    let node_ctrl = node.get_ctrl();
    node_ctrl.install_signal_handler()?;

    if let Some(join_addr) = opts.join.as_deref() {
        if let Err(e) = join_cluster(&node_ctrl, join_addr, NodeId(opts.id), !opts.non_voter, tls.as_ref()) {
            node_ctrl.stop();
            node.wait();
            return Err(e);
        }
    }

    node.wait();

    Ok(())
}

/// Ask the cluster to add this node, following leader redirects
fn join_cluster(
    node_ctrl: &NodeCtrl,
    join_addr: &str,
    id: NodeId,
    voter: bool,
    tls: Option<&TlsParams>,
) -> anyhow::Result<()> {
    let mut target = join_addr.to_owned();

    for attempt in 1..=JOIN_ATTEMPTS {
        if node_ctrl.is_stopped() {
            bail!("Node stopped before joining the cluster");
        }
        let res = match tls {
            Some(tls) => replog::std::RawClient::connect_tls(&target, tls.client.clone()),
            None => replog::std::RawClient::connect(&target),
        }
        .and_then(|mut client| client.join(id, node_ctrl.advertise_addr(), voter));

        match res {
            Ok(()) => {
                info!(%target, %id, voter, "Joined the cluster");
                return Ok(());
            }
            Err(replog::Error::NotLeader { leader: Some(leader) }) => {
                info!(%target, %leader, "Redirected to the leader");
                target = leader;
                continue;
            }
            Err(e @ replog::Error::Unauthorized) => {
                return Err(e).context("Joining the cluster");
            }
            Err(e) => {
                warn!(%target, %e, attempt, "Join failed, retrying");
                target = join_addr.to_owned();
            }
        }
        std::thread::sleep(JOIN_RETRY_DELAY);
    }

    bail!("Could not join the cluster through {join_addr}")
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
