//! Replication
//!
//! Every node keeps two logs. The Raft log holds entries exactly as the
//! leader ordered them, including the uncommitted ones. Once an entry is
//! committed, the applier copies its record to the user log, which is
//! what clients read. The user log never contains anything uncommitted.
//!
//! [`RaftCore`] is the synchronous state machine; [`Raft`] owns it and
//! runs the tasks around it: election timer, applier and one replicator
//! per peer while leading. Lock order: `apply` → `core` → `waiters`.
mod machine;
pub mod state;
pub mod transport;

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use convi::ExpectFrom;
use futures::{stream::FuturesUnordered, StreamExt};
use replog_api::{
    peer::{InstallSnapshot, InstallSnapshotResponse, PeerRequest, PeerResponse},
    EntryKind, LogOffset, Member, Membership, NodeId, TermId,
};
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_rustls::{rustls::ClientConfig, TlsConnector};
use tracing::{debug, error, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::log::{Log, LogError};

pub use self::machine::{
    read_entry, Campaign, MembershipChange, RaftCore, ReplicationAction, Role, RoleState,
};
use self::{state::SnapshotMeta, transport::PeerClients};

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not a leader")]
    NotLeader { leader: Option<String> },
    #[error("leadership lost, the entry may or may not be committed")]
    LeadershipLost,
    #[error("another membership change is in progress")]
    MembershipChangeInProgress,
    #[error("unknown member: {0}")]
    UnknownMember(NodeId),
    #[error("can't remove the last voter")]
    LastVoter,
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer connection: {0}")]
    Transport(io::Error),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("node is shutting down")]
    ShuttingDown,
}

impl RaftError {
    /// Errors after which the node can't keep going
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Io(_)
                | RaftError::Log(
                    LogError::Io(_) | LogError::Corrupted(_) | LogError::InvalidFilePath { .. }
                )
        )
    }
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Raft timings and limits
#[derive(TypedBuilder, Debug, Clone)]
pub struct RaftParams {
    /// How often a leader contacts an idle follower
    #[builder(default = Duration::from_millis(50))]
    pub heartbeat_interval: Duration,
    /// Election timeout is picked randomly between min and max
    #[builder(default = Duration::from_millis(300))]
    pub election_timeout_min: Duration,
    #[builder(default = Duration::from_millis(600))]
    pub election_timeout_max: Duration,
    #[builder(default = Duration::from_secs(2))]
    pub rpc_timeout: Duration,
    /// Max entries in a single `AppendEntries`
    #[builder(default = 512)]
    pub max_append_entries: usize,
    /// Stop adding entries to an `AppendEntries` after that many payload bytes
    #[builder(default = 4 * 1024 * 1024)]
    pub max_append_bytes: usize,
    /// Compact the Raft log after that many applied entries
    #[builder(default = 8192)]
    pub snapshot_threshold: u64,
    /// Send a snapshot instead of entries to followers lagging more than that
    #[builder(default = Some(65536))]
    pub snapshot_lag_threshold: Option<u64>,
    #[builder(default = 1024 * 1024)]
    pub snapshot_chunk_size: usize,
}

impl Default for RaftParams {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How often timers are checked
const TICK_INTERVAL: Duration = Duration::from_millis(10);
const INCOMING_SNAPSHOT_FILE_NAME: &str = "snapshot.incoming";

/// An entry appended by the leader, not necessarily committed yet
#[derive(Debug)]
pub struct Proposal {
    index: LogOffset,
    rx: oneshot::Receiver<RaftResult<LogOffset>>,
}

impl Proposal {
    /// Index in the Raft log
    pub fn index(&self) -> LogOffset {
        self.index
    }

    /// Wait until applied; returns the user log offset of the entry
    pub async fn wait(self) -> RaftResult<LogOffset> {
        self.rx.await.map_err(|_| RaftError::ShuttingDown)?
    }
}

/// Proposer waiting for its entry to be applied
struct Waiter {
    term: TermId,
    tx: oneshot::Sender<RaftResult<LogOffset>>,
}

struct ApplyState {
    last_applied: LogOffset,
}

/// Snapshot being received from the leader
struct IncomingSnapshot {
    file: fs::File,
    last_included_index: LogOffset,
    written: u64,
}

pub struct Raft {
    id: NodeId,
    params: RaftParams,
    data_dir: PathBuf,
    core: Mutex<RaftCore>,
    raft_log: Arc<Log>,
    user_log: Arc<Log>,

    apply: Mutex<ApplyState>,
    /// Copy of `ApplyState::last_applied` for lock-free reads
    last_applied: AtomicU64,
    waiters: Mutex<BTreeMap<LogOffset, Waiter>>,
    incoming_snapshot: Mutex<Option<IncomingSnapshot>>,

    role_tx: watch::Sender<RoleState>,
    commit_tx: watch::Sender<LogOffset>,
    last_index_tx: watch::Sender<LogOffset>,
    /// Latest (possibly uncommitted) membership
    membership_tx: watch::Sender<Membership>,
    /// `next_offset` of the user log, everything below is committed
    records_end_tx: watch::Sender<LogOffset>,

    peers: PeerClients,
    is_node_shutting_down: Arc<AtomicBool>,
}

impl Raft {
    pub fn new(
        id: NodeId,
        params: RaftParams,
        data_dir: impl Into<PathBuf>,
        raft_log: Arc<Log>,
        user_log: Arc<Log>,
        tls: Option<Arc<ClientConfig>>,
        is_node_shutting_down: Arc<AtomicBool>,
    ) -> RaftResult<Self> {
        let data_dir = data_dir.into();
        cleanup_incoming_snapshot(&data_dir)?;
        let core = RaftCore::new(id, params.clone(), &data_dir, raft_log.clone())?;

        let last_applied = core
            .snapshot()
            .map(|s| s.last_included_index)
            .unwrap_or_default();

        let (role_tx, _) = watch::channel(core.role_state());
        let (commit_tx, _) = watch::channel(core.commit_index());
        let (last_index_tx, _) = watch::channel(core.last_log_index());
        let (membership_tx, _) = watch::channel(core.latest_membership());
        let (records_end_tx, _) = watch::channel(user_log.next_offset());

        Ok(Self {
            id,
            peers: PeerClients::new(tls.map(TlsConnector::from), params.rpc_timeout),
            params,
            data_dir,
            core: Mutex::new(core),
            raft_log,
            user_log,
            apply: Mutex::new(ApplyState { last_applied }),
            last_applied: AtomicU64::new(last_applied.as_u64()),
            waiters: Mutex::new(BTreeMap::new()),
            incoming_snapshot: Mutex::new(None),
            role_tx,
            commit_tx,
            last_index_tx,
            membership_tx,
            records_end_tx,
            is_node_shutting_down,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn user_log(&self) -> &Arc<Log> {
        &self.user_log
    }

    pub fn role_state(&self) -> RoleState {
        *self.role_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role_state().role == Role::Leader
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.core.lock().expect("Locking failed").leader_addr()
    }

    pub fn committed_membership(&self) -> Membership {
        self.core
            .lock()
            .expect("Locking failed")
            .committed_membership()
    }

    pub fn commit_index(&self) -> LogOffset {
        *self.commit_tx.borrow()
    }

    pub fn last_applied(&self) -> LogOffset {
        LogOffset(self.last_applied.load(Ordering::SeqCst))
    }

    /// End of the committed part of the user log
    pub fn records_end(&self) -> LogOffset {
        *self.records_end_tx.borrow()
    }

    pub fn subscribe_records_end(&self) -> watch::Receiver<LogOffset> {
        self.records_end_tx.subscribe()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<RoleState> {
        self.role_tx.subscribe()
    }

    fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    fn fail(&self, e: &RaftError) {
        error!(%e, "Fatal replication error, shutting down");
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    /// Run `f` on the locked core, then publish whatever it changed
    fn with_core<T>(&self, f: impl FnOnce(&mut RaftCore) -> RaftResult<T>) -> RaftResult<T> {
        let mut core = self.core.lock().expect("Locking failed");
        let before = core.role_state();

        let res = f(&mut core);
        if let Err(e) = &res {
            if e.is_fatal() {
                self.fail(e);
            }
        }

        let after = core.role_state();
        if before != after {
            debug!(term = %after.term, role = %after.role, leader = ?after.leader_id, "Role state changed");
            self.role_tx.send_replace(after);
        }
        let commit_index = core.commit_index();
        self.commit_tx.send_if_modified(|v| {
            let modified = *v != commit_index;
            *v = commit_index;
            modified
        });
        let last_index = core.last_log_index();
        self.last_index_tx.send_if_modified(|v| {
            let modified = *v != last_index;
            *v = last_index;
            modified
        });
        let membership = core.latest_membership();
        self.membership_tx.send_if_modified(|v| {
            let modified = *v != membership;
            *v = membership;
            modified
        });

        if before.role == Role::Leader && (after.role != Role::Leader || after.term != before.term)
        {
            // committed ones will still be resolved by the applier
            let mut waiters = self.waiters.lock().expect("Locking failed");
            let lost = waiters.split_off(&commit_index.next());
            for (_, waiter) in lost {
                let _ = waiter.tx.send(Err(RaftError::LeadershipLost));
            }
        }

        res
    }

    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> RaftResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Raft) -> RaftResult<T> + Send + 'static,
    {
        let raft = self.clone();
        tokio::task::spawn_blocking(move || f(&raft)).await?
    }

    /// Start a new cluster with this node as the only member, if there's no state yet
    pub fn bootstrap(&self, addr: String) -> RaftResult<bool> {
        self.with_core(|core| core.bootstrap(addr))
    }

    /// Append an entry as a leader, without waiting for it to commit
    async fn start_proposal<F>(self: &Arc<Self>, propose: F) -> RaftResult<Option<Proposal>>
    where
        F: FnOnce(&mut RaftCore) -> RaftResult<Option<LogOffset>> + Send + 'static,
    {
        self.blocking(move |raft| {
            raft.with_core(|core| {
                let Some(index) = propose(core)? else {
                    return Ok(None);
                };
                let (tx, rx) = oneshot::channel();
                raft.waiters.lock().expect("Locking failed").insert(
                    index,
                    Waiter {
                        term: core.current_term(),
                        tx,
                    },
                );
                Ok(Some(Proposal { index, rx }))
            })
        })
        .await
    }

    /// Append a record to the Raft log
    ///
    /// Records proposed one after another land in the log in the same order.
    pub async fn start_command(self: &Arc<Self>, payload: Vec<u8>) -> RaftResult<Proposal> {
        self.start_proposal(move |core| core.propose(EntryKind::Command, &payload).map(Some))
            .await?
            .ok_or(RaftError::ShuttingDown)
    }

    /// Replicate a record; returns its offset in the user log once committed
    pub async fn propose_command(self: &Arc<Self>, payload: Vec<u8>) -> RaftResult<LogOffset> {
        self.start_command(payload).await?.wait().await
    }

    /// Change the membership, wait until the change is committed
    pub async fn change_membership(self: &Arc<Self>, change: MembershipChange) -> RaftResult<()> {
        if let Some(proposal) = self
            .start_proposal(move |core| core.propose_membership_change(change))
            .await?
        {
            proposal.wait().await?;
        }
        Ok(())
    }

    /// Handle a single RPC from another node
    pub async fn handle_peer_request(self: &Arc<Self>, req: PeerRequest) -> RaftResult<PeerResponse> {
        let res = match req {
            PeerRequest::RequestVote(req) => self
                .blocking(move |raft| raft.with_core(|core| core.handle_request_vote(req)))
                .await
                .map(PeerResponse::RequestVote),
            PeerRequest::AppendEntries(req) => self
                .blocking(move |raft| raft.with_core(|core| core.handle_append_entries(req)))
                .await
                .map(PeerResponse::AppendEntries),
            PeerRequest::InstallSnapshot(req) => self
                .blocking(move |raft| raft.install_snapshot_chunk(req))
                .await
                .map(PeerResponse::InstallSnapshot),
        };
        if let Err(e) = &res {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        res
    }

    fn incoming_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(INCOMING_SNAPSHOT_FILE_NAME)
    }

    fn install_snapshot_chunk(&self, req: InstallSnapshot) -> RaftResult<InstallSnapshotResponse> {
        if let Some(resp) = self.with_core(|core| core.accept_snapshot_chunk(req.term, req.leader_id))? {
            return Ok(resp);
        }
        let rejected = InstallSnapshotResponse {
            term: req.term,
            success: false,
        };
        let accepted = InstallSnapshotResponse {
            term: req.term,
            success: true,
        };

        let mut incoming = self.incoming_snapshot.lock().expect("Locking failed");
        if req.chunk_offset == 0 {
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(self.incoming_snapshot_path())?;
            debug!(last_included_index = %req.last_included_index, "Receiving snapshot");
            *incoming = Some(IncomingSnapshot {
                file,
                last_included_index: req.last_included_index,
                written: 0,
            });
        }

        let Some(snapshot) = incoming.as_mut() else {
            debug!(chunk_offset = req.chunk_offset, "Snapshot chunk without a start");
            return Ok(rejected);
        };
        if snapshot.last_included_index != req.last_included_index
            || snapshot.written != req.chunk_offset
        {
            debug!(
                chunk_offset = req.chunk_offset,
                written = snapshot.written,
                "Unexpected snapshot chunk"
            );
            *incoming = None;
            return Ok(rejected);
        }
        snapshot.file.write_all(&req.data)?;
        snapshot.written += u64::expect_from(req.data.len());

        if !req.done {
            return Ok(accepted);
        }

        let IncomingSnapshot { mut file, .. } = incoming.take().expect("checked above");
        drop(incoming);
        file.sync_all()?;
        file.rewind()?;

        let meta = SnapshotMeta {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            records_base: req.records_base,
            records_end: req.records_end,
            membership: req.membership,
        };
        self.restore_snapshot(meta, io::BufReader::new(file))?;
        fs::remove_file(self.incoming_snapshot_path())?;

        Ok(accepted)
    }

    /// Replace the user log with snapshot content and adopt the snapshot
    fn restore_snapshot(&self, meta: SnapshotMeta, content: impl Read) -> RaftResult<()> {
        let mut apply = self.apply.lock().expect("Locking failed");
        if !self
            .core
            .lock()
            .expect("Locking failed")
            .needs_snapshot(&meta)
        {
            debug!(last_included_index = %meta.last_included_index, "Snapshot not needed anymore");
            return Ok(());
        }

        let records_end = self.user_log.restore(meta.records_base, content)?;
        if records_end != meta.records_end {
            return Err(LogError::Corrupted(format!(
                "snapshot ends at {records_end}, expected {}",
                meta.records_end
            ))
            .into());
        }

        let last_included_index = meta.last_included_index;
        self.with_core(|core| core.install_snapshot(meta))?;
        apply.last_applied = last_included_index;
        self.last_applied
            .store(last_included_index.as_u64(), Ordering::SeqCst);
        self.records_end_tx.send_replace(records_end);
        Ok(())
    }

    /// Copy newly committed records to the user log
    fn apply_committed(&self) -> RaftResult<()> {
        let mut apply = self.apply.lock().expect("Locking failed");
        let commit_index = self.core.lock().expect("Locking failed").commit_index();

        let mut applied = vec![];
        while apply.last_applied < commit_index {
            let index = apply.last_applied.next();
            let (header, payload) = read_entry(&self.raft_log, index)?;
            if header.kind == EntryKind::Command {
                let next = self.user_log.next_offset();
                if header.record_offset == next {
                    self.user_log.append(&payload)?;
                } else if next < header.record_offset {
                    return Err(LogError::Corrupted(format!(
                        "entry {index} expects record offset {}, user log is at {next}",
                        header.record_offset
                    ))
                    .into());
                } else {
                    trace!(%index, "Record already applied");
                }
            }
            apply.last_applied = index;
            applied.push((index, header));
        }

        if applied.is_empty() {
            return Ok(());
        }

        self.user_log.flush()?;
        self.user_log.enforce_retention()?;
        self.last_applied
            .store(apply.last_applied.as_u64(), Ordering::SeqCst);
        self.records_end_tx
            .send_replace(self.user_log.next_offset());
        trace!(last_applied = %apply.last_applied, "Applied committed entries");

        {
            let mut waiters = self.waiters.lock().expect("Locking failed");
            for (index, header) in &applied {
                if let Some(waiter) = waiters.remove(index) {
                    let res = if waiter.term == header.term {
                        Ok(header.record_offset)
                    } else {
                        Err(RaftError::LeadershipLost)
                    };
                    let _ = waiter.tx.send(res);
                }
            }
        }

        let last_applied = apply.last_applied;
        let records_base = self.user_log.lowest_offset();
        self.with_core(|core| core.maybe_compact(last_applied, records_base))?;
        Ok(())
    }

    /// Run all the background tasks, until the node is shutting down
    ///
    /// Must be called within a Tokio runtime.
    pub async fn run(self: Arc<Self>) {
        let timer = tokio::spawn(self.clone().run_election_timer());
        let applier = tokio::spawn(self.clone().run_applier());
        let supervisor = tokio::spawn(self.clone().run_replication_supervisor());

        while !self.is_node_shutting_down() {
            sleep(Duration::from_millis(100)).await;
        }

        for task in [timer, applier, supervisor] {
            task.abort();
        }
        let mut waiters = self.waiters.lock().expect("Locking failed");
        for (_, waiter) in std::mem::take(&mut *waiters) {
            let _ = waiter.tx.send(Err(RaftError::ShuttingDown));
        }
        info!("Replication stopped");
    }

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            sleep(TICK_INTERVAL).await;
            match self
                .blocking(|raft| raft.with_core(|core| core.tick(Instant::now())))
                .await
            {
                Ok(Some(campaign)) => {
                    tokio::spawn(self.clone().run_vote_round(campaign));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%e, "Election timer failed");
                    if e.is_fatal() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_vote_round(self: Arc<Self>, campaign: Campaign) {
        let term = campaign.request.term;
        let mut role_rx = self.role_tx.subscribe();
        let req = PeerRequest::RequestVote(campaign.request);

        let mut pending: FuturesUnordered<_> = campaign
            .voters
            .into_iter()
            .map(|(id, addr)| {
                let raft = self.clone();
                let req = req.clone();
                async move { (id, raft.peers.call(id, &addr, &req).await) }
            })
            .collect();

        loop {
            {
                let role = *role_rx.borrow_and_update();
                if role.term != term || role.role != Role::Candidate {
                    return;
                }
            }
            tokio::select! {
                Some((id, res)) = pending.next() => match res {
                    Ok(PeerResponse::RequestVote(resp)) => {
                        trace!(peer = %id, granted = resp.vote_granted, "Vote response");
                        if let Err(e) = self
                            .blocking(move |raft| raft.with_core(|core| core.handle_vote_response(id, resp)))
                            .await
                        {
                            warn!(%e, "Handling vote response failed");
                        }
                    }
                    Ok(other) => warn!(peer = %id, ?other, "Unexpected response to vote request"),
                    Err(e) => debug!(peer = %id, %e, "Vote request failed"),
                },
                res = role_rx.changed() => if res.is_err() {
                    return;
                },
            }
        }
    }

    async fn run_applier(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            commit_rx.borrow_and_update();
            if let Err(e) = self.blocking(|raft| raft.apply_committed()).await {
                self.fail(&e);
                return;
            }
            if commit_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Keep one replicator per peer running while we're the leader
    async fn run_replication_supervisor(self: Arc<Self>) {
        let mut role_rx = self.role_tx.subscribe();
        let mut membership_rx = self.membership_tx.subscribe();
        let mut replicators: BTreeMap<NodeId, JoinHandle<()>> = BTreeMap::new();
        let mut replicators_term = TermId(0);

        loop {
            let role = *role_rx.borrow_and_update();
            let membership = membership_rx.borrow_and_update().clone();

            if role.role != Role::Leader || role.term != replicators_term {
                for (_, task) in std::mem::take(&mut replicators) {
                    task.abort();
                }
                replicators_term = role.term;
            }
            if role.role == Role::Leader {
                replicators.retain(|id, task| {
                    let keep = membership.contains(*id) && !task.is_finished();
                    if !keep {
                        task.abort();
                    }
                    keep
                });
                for member in membership.members() {
                    if member.id != self.id && !replicators.contains_key(&member.id) {
                        debug!(peer = %member.id, term = %role.term, "Starting replicator");
                        replicators.insert(
                            member.id,
                            tokio::spawn(self.clone().run_replicator(member.id, role.term)),
                        );
                    }
                }
            }
            self.peers.retain(&membership);

            tokio::select! {
                res = role_rx.changed() => if res.is_err() { return },
                res = membership_rx.changed() => if res.is_err() { return },
                _ = sleep(Duration::from_millis(500)) => {},
            }
        }
    }

    /// Replicate to `peer` as long as we're the leader of `term`
    async fn run_replicator(self: Arc<Self>, peer: NodeId, term: TermId) {
        let mut role_rx = self.role_tx.subscribe();
        let mut last_index_rx = self.last_index_tx.subscribe();
        let mut commit_rx = self.commit_tx.subscribe();

        loop {
            {
                let role = *role_rx.borrow_and_update();
                if role.role != Role::Leader || role.term != term || self.is_node_shutting_down() {
                    debug!(%peer, %term, "Replicator done");
                    return;
                }
            }
            last_index_rx.borrow_and_update();
            commit_rx.borrow_and_update();

            match self.replicate_once(peer).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    trace!(%peer, %e, "Replication failed");
                    if e.is_fatal() {
                        self.fail(&e);
                        return;
                    }
                }
            }

            tokio::select! {
                _ = sleep(self.params.heartbeat_interval) => {},
                _ = last_index_rx.changed() => {},
                _ = commit_rx.changed() => {},
                _ = role_rx.changed() => {},
            }
        }
    }

    fn member_addr(&self, peer: NodeId) -> Option<String> {
        self.membership_tx.borrow().get(peer).map(Member::addr)
    }

    /// Send whatever `peer` needs next; returns `true` if there's more to send right away
    async fn replicate_once(self: &Arc<Self>, peer: NodeId) -> RaftResult<bool> {
        let Some(addr) = self.member_addr(peer) else {
            return Ok(false);
        };
        let last_applied = self.last_applied();
        let action = self
            .blocking(move |raft| {
                raft.core
                    .lock()
                    .expect("Locking failed")
                    .replication_action(peer, last_applied)
            })
            .await?;

        match action {
            None => Ok(false),
            Some(ReplicationAction::Append { request, last_sent }) => {
                let resp = match self
                    .peers
                    .call(peer, &addr, &PeerRequest::AppendEntries(request))
                    .await?
                {
                    PeerResponse::AppendEntries(resp) => resp,
                    other => {
                        warn!(%peer, ?other, "Unexpected response to append entries");
                        return Ok(false);
                    }
                };
                self.blocking(move |raft| {
                    raft.with_core(|core| core.handle_append_response(peer, resp, last_sent))
                })
                .await?;
                Ok(!resp.success || last_sent < *self.last_index_tx.borrow())
            }
            Some(ReplicationAction::Snapshot) => {
                self.send_snapshot(peer, &addr).await?;
                Ok(true)
            }
        }
    }

    async fn send_snapshot(self: &Arc<Self>, peer: NodeId, addr: &str) -> RaftResult<()> {
        let (point, term, records_base, reader) = self
            .blocking(|raft| {
                let apply = raft.apply.lock().expect("Locking failed");
                let core = raft.core.lock().expect("Locking failed");
                let point = core.snapshot_point(apply.last_applied)?;
                let reader = raft.user_log.reader_until(point.records_end)?;
                Ok((point, core.current_term(), raft.user_log.lowest_offset(), reader))
            })
            .await?;

        info!(
            %peer,
            last_included_index = %point.index,
            bytes = reader.byte_len(),
            "Sending snapshot"
        );

        let total = reader.byte_len();
        let chunk_size = self.params.snapshot_chunk_size;
        let mut reader = Some(reader);
        let mut chunk_offset = 0u64;
        loop {
            let mut r = reader.take().expect("reader returned");
            let (r, data) = tokio::task::spawn_blocking(move || -> RaftResult<_> {
                let mut data = vec![];
                (&mut r)
                    .take(u64::expect_from(chunk_size))
                    .read_to_end(&mut data)?;
                Ok((r, data))
            })
            .await??;
            reader = Some(r);

            let len = u64::expect_from(data.len());
            let done = total <= chunk_offset + len;
            let req = PeerRequest::InstallSnapshot(InstallSnapshot::new(
                term,
                self.id,
                point.index,
                point.term,
                records_base,
                point.records_end,
                point.membership.clone(),
                chunk_offset,
                done,
                data,
            ));

            let resp = match self.peers.call(peer, addr, &req).await? {
                PeerResponse::InstallSnapshot(resp) => resp,
                other => {
                    warn!(%peer, ?other, "Unexpected response to install snapshot");
                    return Ok(());
                }
            };

            if !resp.success || done {
                let index = point.index;
                self.blocking(move |raft| {
                    raft.with_core(|core| core.handle_snapshot_response(peer, resp, index))
                })
                .await?;
                return Ok(());
            }
            chunk_offset += len;
        }
    }
}

/// Remove leftovers of an interrupted snapshot transfer
fn cleanup_incoming_snapshot(data_dir: &Path) -> io::Result<()> {
    match fs::remove_file(data_dir.join(INCOMING_SNAPSHOT_FILE_NAME)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
