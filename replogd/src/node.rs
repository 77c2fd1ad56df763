mod peer_handler;
mod request_handler;

use crate::auth::{AllowAll, Authorizer};
use crate::log::{Log, LogConfig};
use crate::node::peer_handler::PeerHandler;
use crate::node::request_handler::RequestHandler;
use crate::raft::{Raft, RaftParams, RoleState};
use crate::task::PanicGuard;
use crate::tls::TlsParams;
use replog_api::{LogOffset, Membership, NodeId};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

pub use self::request_handler::ServiceError;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    #[builder(default = Parameters::DEFAULT_NODE_ID)]
    pub id: NodeId,

    /// Where to listen for both client and peer connections
    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Address other nodes should use to reach us
    ///
    /// Defaults to the address we ended up bound to.
    #[builder(default, setter(strip_option))]
    pub advertise: Option<String>,

    /// Base path where both logs and the Raft state are stored
    pub data_dir: PathBuf,

    /// Start a new cluster, with this node as the only voter
    ///
    /// Ignored if the node has any Raft state already.
    #[builder(default)]
    pub bootstrap: bool,

    /// Start a new segment after the store file reached this size
    #[builder(default = LogConfig::DEFAULT_MAX_STORE_BYTES)]
    pub max_store_bytes: u64,

    /// Start a new segment after the index file reached this size
    #[builder(default = LogConfig::DEFAULT_MAX_INDEX_BYTES)]
    pub max_index_bytes: u64,

    /// Keep at most that many bytes of records, dropping the oldest
    ///
    /// Records that were dropped can't be consumed anymore. Unlimited
    /// if not set.
    #[builder(default, setter(strip_option))]
    pub max_log_bytes: Option<u64>,

    #[builder(default)]
    pub raft: RaftParams,

    /// Mutual TLS for all connections, plain TCP if not set
    #[builder(default, setter(strip_option))]
    pub tls: Option<TlsParams>,

    #[builder(default = Arc::new(AllowAll))]
    pub authorizer: Arc<dyn Authorizer>,
}

impl Parameters {
    pub const DEFAULT_NODE_ID: NodeId = NodeId(0);
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

    fn log_config(&self, initial_offset: LogOffset, max_log_bytes: Option<u64>) -> LogConfig {
        LogConfig::builder()
            .max_store_bytes(self.max_store_bytes)
            .max_index_bytes(self.max_index_bytes)
            .initial_offset(initial_offset)
            .max_log_bytes(max_log_bytes)
            .build()
    }
}

pub struct NodeShared {
    params: Parameters,

    is_node_shutting_down: Arc<AtomicBool>,

    raft: Arc<Raft>,

    tls_acceptor: Option<TlsAcceptor>,

    /// Number of currently open consume streams
    consume_streams: Arc<AtomicUsize>,
}

impl NodeShared {
    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_node_shutting_down.clone())
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn raft(&self) -> &Arc<Raft> {
        &self.raft
    }

    pub fn user_log(&self) -> &Arc<Log> {
        self.raft.user_log()
    }

    /// Count a consume stream as open until the returned guard is dropped
    pub fn consume_stream_guard(&self) -> ConsumeStreamGuard {
        self.consume_streams.fetch_add(1, Ordering::SeqCst);
        ConsumeStreamGuard(self.consume_streams.clone())
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.params.authorizer.as_ref()
    }
}

pub struct ConsumeStreamGuard(Arc<AtomicUsize>);

impl Drop for ConsumeStreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    rpc_addr: SocketAddr,
    advertise_addr: String,
    raft: Arc<Raft>,
    consume_streams: Arc<AtomicUsize>,
}

impl NodeCtrl {
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Address the node registers itself with in the cluster
    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn role_state(&self) -> RoleState {
        self.raft.role_state()
    }

    pub fn committed_membership(&self) -> Membership {
        self.raft.committed_membership()
    }

    /// End of the user log
    pub fn records_end(&self) -> LogOffset {
        self.raft.records_end()
    }

    /// Consume streams being served right now
    pub fn consume_streams(&self) -> usize {
        self.consume_streams.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    ctrl: NodeCtrl,
    /// Tokio executor handling client and incoming peer connections
    #[allow(unused)]
    request_handler: RequestHandler,
    /// Tokio executor running elections and replication
    #[allow(unused)]
    peer_handler: PeerHandler,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}

impl Node {
    pub fn new(params: Parameters) -> anyhow::Result<Self> {
        info!(
            id = %params.id,
            bind = %params.bind,
            "data-dir" = %params.data_dir.display(),
            tls = params.tls.is_some(),
            "Starting replogd"
        );

        std::fs::create_dir_all(&params.data_dir)?;
        let user_log = Arc::new(Log::open(
            params.data_dir.join("log"),
            params.log_config(LogOffset::zero(), params.max_log_bytes),
        )?);
        let raft_log = Arc::new(Log::open(
            params.data_dir.join("raft"),
            // compacted through snapshots instead
            params.log_config(LogOffset(1), None),
        )?);

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));

        let raft = Arc::new(Raft::new(
            params.id,
            params.raft.clone(),
            &params.data_dir,
            raft_log,
            user_log,
            params.tls.as_ref().map(|tls| tls.client.clone()),
            is_node_shutting_down.clone(),
        )?);

        let consume_streams = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(NodeShared {
            params: params.clone(),
            consume_streams: consume_streams.clone(),
            is_node_shutting_down: is_node_shutting_down.clone(),
            raft: raft.clone(),
            tls_acceptor: params
                .tls
                .as_ref()
                .map(|tls| TlsAcceptor::from(tls.server.clone())),
        });

        let request_handler = RequestHandler::new(shared.clone(), params.bind)?;
        let rpc_addr = request_handler.local_addr();
        let advertise_addr = params
            .advertise
            .clone()
            .unwrap_or_else(|| rpc_addr.to_string());

        if params.bootstrap && raft.bootstrap(advertise_addr.clone())? {
            info!(%advertise_addr, "Cluster bootstrapped");
        }

        let peer_handler = PeerHandler::new(shared)?;

        Ok(Node {
            stop_on_drop: true,
            ctrl: NodeCtrl {
                is_node_shutting_down: is_node_shutting_down.clone(),
                rpc_addr,
                advertise_addr,
                raft,
                consume_streams,
            },
            request_handler,
            peer_handler,
            is_node_shutting_down,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            rpc_addr: self.ctrl.rpc_addr,
            advertise_addr: self.ctrl.advertise_addr.clone(),
            raft: self.ctrl.raft.clone(),
            consume_streams: self.ctrl.consume_streams.clone(),
        }
    }

    /// Block until the node is stopped (see [`NodeCtrl::stop`])
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}
