#![allow(unused)]

use anyhow::{bail, Result};
use replog_api::NodeId;
use replogd::{Node, NodeCtrl, Parameters, RaftParams, Role};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const TIMEOUT: Duration = Duration::from_secs(20);

/// Raft timings short enough for tests to run quickly
pub fn fast_raft() -> RaftParams {
    RaftParams::builder()
        .heartbeat_interval(Duration::from_millis(20))
        .election_timeout_min(Duration::from_millis(150))
        .election_timeout_max(Duration::from_millis(300))
        .rpc_timeout(Duration::from_millis(500))
        .build()
}

/// Log to the test harness' captured output; set `RUST_LOG` to see more
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Poll `f` until it returns `true`
pub fn wait_until(what: &str, mut f: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !f() {
        if TIMEOUT < start.elapsed() {
            bail!("Timeout waiting for: {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

pub struct TestNode {
    #[allow(unused)]
    data_dir: tempfile::TempDir,
    params: Parameters,
    node: Option<Node>,
}

impl TestNode {
    /// A node with no Raft state, to be joined into a cluster
    pub fn new(id: u64) -> Result<Self> {
        Self::new_with(id, false, |_| {})
    }

    /// The first node of a new cluster; returns once it's the leader
    pub fn bootstrap() -> Result<Self> {
        Self::bootstrap_with(|_| {})
    }

    pub fn bootstrap_with(customize: impl FnOnce(&mut Parameters)) -> Result<Self> {
        let node = Self::new_with(1, true, customize)?;
        node.wait_for_role(Role::Leader)?;
        Ok(node)
    }

    pub fn new_with(
        id: u64,
        bootstrap: bool,
        customize: impl FnOnce(&mut Parameters),
    ) -> Result<Self> {
        init_logging();
        let dir = tempfile::tempdir()?;
        let mut params = Parameters::builder()
            .id(NodeId(id))
            .data_dir(dir.path().to_owned())
            .bootstrap(bootstrap)
            .raft(fast_raft())
            .build();
        customize(&mut params);

        let node = Node::new(params.clone())?;
        // restarts must come back on the same address, it's what the cluster knows
        params.bind = node.get_ctrl().rpc_addr();

        Ok(Self {
            data_dir: dir,
            params,
            node: Some(node),
        })
    }

    pub fn id(&self) -> NodeId {
        self.params.id
    }

    pub fn addr(&self) -> String {
        self.ctrl().rpc_addr().to_string()
    }

    pub fn ctrl(&self) -> NodeCtrl {
        self.node().get_ctrl()
    }

    pub fn node(&self) -> &Node {
        self.node.as_ref().expect("Node was already dropped")
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn role(&self) -> Role {
        self.ctrl().role_state().role
    }

    pub fn wait_for_role(&self, role: Role) -> Result<()> {
        wait_until(&format!("node {} to become {role}", self.id()), || {
            self.role() == role
        })
    }

    /// Wait until the node applied `n` records
    pub fn wait_for_records(&self, n: u64) -> Result<()> {
        wait_until(&format!("node {} to have {n} records", self.id()), || {
            n <= self.ctrl().records_end().as_u64()
        })
    }

    pub fn stop(&mut self) {
        if let Some(node) = self.node.take() {
            node.get_ctrl().stop();
            node.wait();
        }
    }

    /// Stop the node and start it again on the same data
    pub fn restart(&mut self) -> Result<()> {
        self.stop();
        let mut params = self.params.clone();
        params.bootstrap = false;
        self.node = Some(Node::new(params)?);
        Ok(())
    }

    pub fn new_client(&self) -> Result<replog::std::RawClient> {
        Ok(replog::std::RawClient::connect(&self.addr())?)
    }

    pub async fn new_client_async(&self) -> Result<replog::tokio::AsyncClient> {
        Ok(replog::tokio::AsyncClient::connect(&self.addr()).await?)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop(); // before tmp directory is cleaned
    }
}

/// Add `node` to the cluster through `leader`
///
/// Retries while the leader is still committing a previous change.
pub fn join(leader: &TestNode, node: &TestNode, voter: bool) -> Result<()> {
    let start = Instant::now();
    loop {
        let mut client = leader.new_client()?;
        match client.join(node.id(), &node.addr(), voter) {
            Ok(()) => return Ok(()),
            Err(replog::Error::Invalid(msg)) if start.elapsed() < TIMEOUT => {
                tracing::debug!(%msg, "Join refused, retrying");
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A bootstrapped node plus `n - 1` joined voters
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(n: u64) -> Result<Self> {
        Self::new_with(n, |_| {})
    }

    pub fn new_with(n: u64, customize: impl Fn(&mut Parameters)) -> Result<Self> {
        let first = TestNode::bootstrap_with(&customize)?;
        let mut nodes = vec![first];
        for id in 2..=n {
            let node = TestNode::new_with(id, false, &customize)?;
            join(&nodes[0], &node, true)?;
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id() == id)
            .expect("no such node")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TestNode {
        self.nodes
            .iter_mut()
            .find(|node| node.id() == id)
            .expect("no such node")
    }

    /// Wait until a single running node considers itself the leader
    pub fn wait_for_leader(&self) -> Result<NodeId> {
        let mut leader = None;
        wait_until("a leader", || {
            let leaders: Vec<_> = self
                .nodes
                .iter()
                .filter(|node| node.node.is_some() && node.role() == Role::Leader)
                .map(TestNode::id)
                .collect();
            leader = leaders.first().copied();
            leaders.len() == 1
        })?;
        Ok(leader.expect("checked above"))
    }
}
