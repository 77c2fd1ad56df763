//! Raft state machine
//!
//! [`RaftCore`] does no networking and never waits: every method is
//! called with the core locked, does its (disk) work and returns what the
//! caller should send out. See [`super::Raft`] for the async side.
use std::{
    collections::{BTreeMap, BTreeSet},
    io::Cursor,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use binrw::{io::NoSeek, BinRead, BinWrite};
use derive_more::Display;
use rand::Rng;
use replog_api::{
    peer::{
        AppendEntries, AppendEntriesResponse, InstallSnapshotResponse, PeerEntry, RequestVote,
        RequestVoteResponse,
    },
    EntryKind, LogOffset, Member, Membership, NodeId, RaftEntryHeader, TermId,
};
use tracing::{debug, info, warn};

use crate::log::{Log, LogError};

use super::{
    state::{self, PersistentState, SnapshotMeta},
    RaftError, RaftParams, RaftResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
pub enum Role {
    /// Follows the leader, serves relaxed reads
    #[default]
    Follower,
    /// Asking for votes
    Candidate,
    /// Handles writes and replicates them
    Leader,
}

/// What the rest of the node needs to know about the role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleState {
    pub term: TermId,
    pub role: Role,
    pub leader_id: Option<NodeId>,
}

/// A change of the cluster membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// Add a member, or change its voting status
    Upsert(Member),
    Remove(NodeId),
}

/// Leader's view of a single follower
#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: LogOffset,
    match_index: LogOffset,
    /// The follower answered at least once, so `next_index` reflects its log
    probed: bool,
}

/// Election started by [`RaftCore::tick`]
#[derive(Debug, Clone)]
pub struct Campaign {
    pub request: RequestVote,
    /// Voters to ask, with their addresses
    pub voters: Vec<(NodeId, String)>,
}

/// The applied state a snapshot can be built from
#[derive(Debug, Clone)]
pub struct SnapshotPoint {
    pub index: LogOffset,
    pub term: TermId,
    pub records_end: LogOffset,
    pub membership: Membership,
}

/// What to send to a follower next
#[derive(Debug, Clone)]
pub enum ReplicationAction {
    Append {
        request: AppendEntries,
        /// Index of the last entry in `request`
        last_sent: LogOffset,
    },
    /// Follower needs entries we don't have in the log anymore, or is too far behind
    Snapshot,
}

pub fn encode_entry(header: &RaftEntryHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RaftEntryHeader::BYTE_SIZE + payload.len());
    header
        .write(&mut NoSeek::new(&mut buf))
        .expect("can't fail");
    buf.extend_from_slice(payload);
    buf
}

/// Read a Raft log entry, split into its header and payload
pub fn read_entry(log: &Log, index: LogOffset) -> RaftResult<(RaftEntryHeader, Vec<u8>)> {
    let mut record = log.read(index)?;
    let header = RaftEntryHeader::read(&mut Cursor::new(&record))
        .map_err(|e| LogError::Corrupted(format!("invalid entry {index}: {e}")))?;
    let payload = record.split_off(RaftEntryHeader::BYTE_SIZE);
    Ok((header, payload))
}

pub fn decode_membership(payload: &[u8]) -> RaftResult<Membership> {
    Membership::read(&mut Cursor::new(payload))
        .map_err(|e| LogError::Corrupted(format!("invalid membership: {e}")).into())
}

pub fn encode_membership(membership: &Membership) -> Vec<u8> {
    let mut buf = vec![];
    membership
        .write(&mut NoSeek::new(&mut buf))
        .expect("can't fail");
    buf
}

#[derive(Debug)]
pub struct RaftCore {
    id: NodeId,
    params: RaftParams,
    /// Where state files are kept
    dir: PathBuf,
    /// The Raft log; an entry's index is its offset
    log: Arc<Log>,
    state: PersistentState,
    snapshot: Option<SnapshotMeta>,

    role: Role,
    leader_id: Option<NodeId>,
    commit_index: LogOffset,
    /// Every configuration still in the log, plus the one from the snapshot
    configs: BTreeMap<LogOffset, Membership>,
    /// `records_end` of the last entry in the log
    last_records_end: LogOffset,

    /// Votes received as a candidate
    votes: BTreeSet<NodeId>,
    /// Followers, as a leader
    progress: BTreeMap<NodeId, Progress>,
    /// Index of the `Noop` the current leadership started with
    term_start_index: LogOffset,

    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
}

impl RaftCore {
    pub fn new(
        id: NodeId,
        params: RaftParams,
        dir: impl Into<PathBuf>,
        log: Arc<Log>,
    ) -> RaftResult<Self> {
        let dir = dir.into();
        let state = state::load_state(&dir)?;
        let snapshot = state::load_snapshot_meta(&dir)?;

        let mut configs = BTreeMap::new();
        let mut last_records_end = LogOffset::zero();
        let mut first_index = log.lowest_offset();

        if let Some(snapshot) = &snapshot {
            if log.next_offset() <= snapshot.last_included_index
                || snapshot.last_included_index.next() < log.lowest_offset()
            {
                warn!(
                    last_included_index = %snapshot.last_included_index,
                    "Raft log does not line up with the snapshot, resetting it"
                );
                log.reset(snapshot.last_included_index.next())?;
            }
            configs.insert(snapshot.last_included_index, snapshot.membership.clone());
            last_records_end = snapshot.records_end;
            first_index = snapshot.last_included_index.next();
        }

        let mut index = first_index;
        while index < log.next_offset() {
            let (header, payload) = read_entry(&log, index)?;
            if header.kind == EntryKind::Config {
                configs.insert(index, decode_membership(&payload)?);
            }
            last_records_end = header.records_end();
            index = index.next();
        }

        let last_log_index = log.next_offset().prev();
        let commit_index = std::cmp::min(
            std::cmp::max(
                state.commit_floor,
                snapshot
                    .as_ref()
                    .map(|s| s.last_included_index)
                    .unwrap_or_default(),
            ),
            last_log_index,
        );

        info!(
            %id,
            term = %state.current_term,
            %last_log_index,
            %commit_index,
            "Raft state loaded"
        );

        let mut s = Self {
            id,
            params,
            dir,
            log,
            state,
            snapshot,
            role: Role::Follower,
            leader_id: None,
            commit_index,
            configs,
            last_records_end,
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            term_start_index: LogOffset::zero(),
            election_deadline: Instant::now(),
            last_leader_contact: None,
        };
        s.reset_election_deadline();
        Ok(s)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> TermId {
        self.state.current_term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn role_state(&self) -> RoleState {
        RoleState {
            term: self.state.current_term,
            role: self.role,
            leader_id: self.leader_id,
        }
    }

    pub fn commit_index(&self) -> LogOffset {
        self.commit_index
    }

    pub fn last_log_index(&self) -> LogOffset {
        self.log.next_offset().prev()
    }

    pub fn snapshot(&self) -> Option<&SnapshotMeta> {
        self.snapshot.as_ref()
    }

    fn snapshot_index(&self) -> LogOffset {
        self.snapshot
            .as_ref()
            .map(|s| s.last_included_index)
            .unwrap_or_default()
    }

    /// Address of the current leader, if known
    pub fn leader_addr(&self) -> Option<String> {
        let leader_id = self.leader_id?;
        self.latest_membership().get(leader_id).map(Member::addr)
    }

    pub fn membership_at(&self, index: LogOffset) -> Membership {
        self.configs
            .range(..=index)
            .next_back()
            .map(|(_, m)| m.clone())
            .unwrap_or_default()
    }

    /// Membership as of the commit index
    pub fn committed_membership(&self) -> Membership {
        self.membership_at(self.commit_index)
    }

    /// Membership from the last configuration entry, committed or not
    pub fn latest_membership(&self) -> Membership {
        self.configs
            .values()
            .next_back()
            .cloned()
            .unwrap_or_default()
    }

    fn latest_config_index(&self) -> LogOffset {
        self.configs.keys().next_back().copied().unwrap_or_default()
    }

    /// Term of the entry at `index`, `None` if not in the log (anymore)
    pub fn term_at(&self, index: LogOffset) -> RaftResult<Option<TermId>> {
        if index == LogOffset::zero() {
            return Ok(Some(TermId(0)));
        }
        if let Some(snapshot) = &self.snapshot {
            if snapshot.last_included_index == index {
                return Ok(Some(snapshot.last_included_term));
            }
        }
        match read_entry(&self.log, index) {
            Ok((header, _)) => Ok(Some(header.term)),
            Err(RaftError::Log(LogError::OffsetNotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn last_log_term(&self) -> RaftResult<TermId> {
        Ok(self
            .term_at(self.last_log_index())?
            .unwrap_or_default())
    }

    fn persist_state(&self) -> RaftResult<()> {
        state::save_state(&self.dir, &self.state)
    }

    fn reset_election_deadline(&mut self) {
        let min = self.params.election_timeout_min;
        let max = std::cmp::max(min, self.params.election_timeout_max);
        self.election_deadline = Instant::now() + rand::thread_rng().gen_range(min..=max);
    }

    fn leader_recently_seen(&self, now: Instant) -> bool {
        self.role == Role::Leader
            || self
                .last_leader_contact
                .map(|t| now.duration_since(t) < self.params.election_timeout_min)
                .unwrap_or(false)
    }

    fn append_entry(&mut self, header: RaftEntryHeader, payload: &[u8]) -> RaftResult<LogOffset> {
        let index = self.log.append(&encode_entry(&header, payload))?;
        if header.kind == EntryKind::Config {
            self.configs.insert(index, decode_membership(payload)?);
            if self.role == Role::Leader {
                self.sync_progress(index);
            }
        }
        self.last_records_end = header.records_end();
        Ok(index)
    }

    /// Make `progress` track exactly the members of the latest membership
    fn sync_progress(&mut self, next_index: LogOffset) {
        let membership = self.latest_membership();
        self.progress.retain(|id, _| membership.contains(*id));
        for member in membership.members() {
            if member.id != self.id {
                self.progress.entry(member.id).or_insert(Progress {
                    next_index,
                    match_index: LogOffset::zero(),
                    probed: false,
                });
            }
        }
    }

    fn truncate_log_suffix(&mut self, index: LogOffset) -> RaftResult<()> {
        debug!(%index, "removing conflicting entries");
        self.log.truncate_suffix(index)?;
        drop(self.configs.split_off(&index));

        let last = index.prev();
        self.last_records_end = if last <= self.snapshot_index() {
            self.snapshot
                .as_ref()
                .map(|s| s.records_end)
                .unwrap_or_default()
        } else {
            read_entry(&self.log, last)?.0.records_end()
        };
        Ok(())
    }

    fn set_commit_index(&mut self, new: LogOffset) -> RaftResult<()> {
        if new <= self.commit_index {
            return Ok(());
        }
        let old = self.commit_index;
        self.commit_index = new;
        debug!(commit_index = %new, "commit index advanced");

        if self.configs.range(old.next()..=new).next().is_some() {
            self.state.commit_floor = new;
            self.persist_state()?;

            let membership = self.committed_membership();
            info!(members = ?membership.members(), "membership committed");
            if self.role == Role::Leader && !membership.is_voter(self.id) {
                info!("Not a voter anymore, stepping down");
                self.become_follower(self.state.current_term, None)?;
            }
        }
        Ok(())
    }

    fn become_follower(&mut self, term: TermId, leader_id: Option<NodeId>) -> RaftResult<()> {
        let new_term = self.state.current_term < term;
        if new_term {
            self.state.current_term = term;
            self.state.voted_for = None;
            self.persist_state()?;
        }
        if self.role != Role::Follower {
            info!(%term, role = %self.role, "Becoming follower");
        }
        self.role = Role::Follower;
        if leader_id.is_some() || new_term || self.leader_id == Some(self.id) {
            self.leader_id = leader_id;
        }
        self.votes.clear();
        self.progress.clear();
        self.reset_election_deadline();
        Ok(())
    }

    /// Create the initial membership with ourselves as the only voter
    ///
    /// Does nothing if there's any Raft state already.
    pub fn bootstrap(&mut self, addr: String) -> RaftResult<bool> {
        if self.last_log_index() != LogOffset::zero() || self.snapshot.is_some() {
            return Ok(false);
        }

        let membership = Membership::new([Member::new(self.id, addr, true)]);
        let term = TermId(1);
        self.state.current_term = term;
        self.state.voted_for = None;

        let index = self.append_entry(
            RaftEntryHeader {
                term,
                kind: EntryKind::Config,
                record_offset: LogOffset::zero(),
            },
            &encode_membership(&membership),
        )?;
        self.log.flush()?;

        self.state.commit_floor = index;
        self.persist_state()?;
        self.commit_index = index;
        // no reason to wait, nobody else can win
        self.election_deadline = Instant::now();

        info!(id = %self.id, "Bootstrapped a new cluster");
        Ok(true)
    }

    /// Drive timers; starts an election when it's time
    pub fn tick(&mut self, now: Instant) -> RaftResult<Option<Campaign>> {
        if self.role == Role::Leader || now < self.election_deadline {
            return Ok(None);
        }
        if !self.committed_membership().is_voter(self.id) {
            self.reset_election_deadline();
            return Ok(None);
        }
        self.start_election()
    }

    fn start_election(&mut self) -> RaftResult<Option<Campaign>> {
        self.state.current_term = self.state.current_term.next();
        self.state.voted_for = Some(self.id);
        self.persist_state()?;

        self.role = Role::Candidate;
        self.leader_id = None;
        self.votes = BTreeSet::from([self.id]);
        self.reset_election_deadline();

        info!(term = %self.state.current_term, "Starting election");

        if self.has_vote_quorum() {
            self.become_leader()?;
            return Ok(None);
        }

        let request = RequestVote {
            term: self.state.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term()?,
        };
        let voters = self
            .committed_membership()
            .voters()
            .filter(|m| m.id != self.id)
            .map(|m| (m.id, m.addr()))
            .collect();

        Ok(Some(Campaign { request, voters }))
    }

    fn has_vote_quorum(&self) -> bool {
        let membership = self.committed_membership();
        let granted = membership
            .voters()
            .filter(|m| self.votes.contains(&m.id))
            .count();
        membership.quorum() <= granted
    }

    fn become_leader(&mut self) -> RaftResult<()> {
        info!(term = %self.state.current_term, "Becoming leader");
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.progress.clear();
        self.sync_progress(self.last_log_index().next());

        self.term_start_index = self.append_entry(
            RaftEntryHeader {
                term: self.state.current_term,
                kind: EntryKind::Noop,
                record_offset: self.last_records_end,
            },
            &[],
        )?;
        self.log.flush()?;
        self.advance_commit()?;
        Ok(())
    }

    pub fn handle_request_vote(&mut self, req: RequestVote) -> RaftResult<RequestVoteResponse> {
        let now = Instant::now();
        if self.state.current_term < req.term && self.leader_recently_seen(now) {
            debug!(candidate = %req.candidate_id, term = %req.term, "Ignoring vote request, leader is alive");
            return Ok(RequestVoteResponse {
                term: self.state.current_term,
                vote_granted: false,
            });
        }

        if self.state.current_term < req.term {
            self.become_follower(req.term, None)?;
        }

        let log_ok = (self.last_log_term()?, self.last_log_index())
            <= (req.last_log_term, req.last_log_index);
        let vote_granted = req.term == self.state.current_term
            && self
                .state
                .voted_for
                .map(|id| id == req.candidate_id)
                .unwrap_or(true)
            && log_ok;

        if vote_granted {
            self.state.voted_for = Some(req.candidate_id);
            self.persist_state()?;
            self.reset_election_deadline();
        }
        debug!(candidate = %req.candidate_id, term = %req.term, vote_granted, "Vote request");

        Ok(RequestVoteResponse {
            term: self.state.current_term,
            vote_granted,
        })
    }

    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
    ) -> RaftResult<()> {
        if self.state.current_term < resp.term {
            return self.become_follower(resp.term, None);
        }
        if self.role != Role::Candidate || resp.term != self.state.current_term {
            return Ok(());
        }
        if resp.vote_granted {
            self.votes.insert(from);
            if self.has_vote_quorum() {
                self.become_leader()?;
            }
        }
        Ok(())
    }

    pub fn handle_append_entries(
        &mut self,
        req: AppendEntries,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.state.current_term {
            return Ok(AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                last_log_index: self.last_log_index(),
            });
        }

        self.become_follower(req.term, Some(req.leader_id))?;
        self.last_leader_contact = Some(Instant::now());

        let last = self.last_log_index();
        let prev_ok = if last < req.prev_log_index {
            false
        } else if req.prev_log_index <= self.snapshot_index() {
            true
        } else {
            self.term_at(req.prev_log_index)? == Some(req.prev_log_term)
        };

        if !prev_ok {
            return Ok(AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                last_log_index: std::cmp::min(last, req.prev_log_index.prev()),
            });
        }

        let mut index = req.prev_log_index;
        let mut appended = false;
        for entry in req.entries {
            index = index.next();
            if index <= self.snapshot_index() {
                continue;
            }
            if index <= self.last_log_index() {
                if self.term_at(index)? == Some(entry.header.term) {
                    continue;
                }
                if index <= self.commit_index {
                    return Err(LogError::Corrupted(format!(
                        "leader conflicts with committed entry {index}"
                    ))
                    .into());
                }
                self.truncate_log_suffix(index)?;
            }
            self.append_entry(entry.header, &entry.payload)?;
            appended = true;
        }
        if appended {
            self.log.flush()?;
        }

        if self.commit_index < req.leader_commit {
            self.set_commit_index(std::cmp::min(req.leader_commit, index))?;
        }

        Ok(AppendEntriesResponse {
            term: self.state.current_term,
            success: true,
            last_log_index: self.last_log_index(),
        })
    }

    fn ensure_leader(&self) -> RaftResult<()> {
        if self.role == Role::Leader {
            Ok(())
        } else {
            Err(RaftError::NotLeader {
                leader: self.leader_addr(),
            })
        }
    }

    /// Append a new entry as a leader
    pub fn propose(&mut self, kind: EntryKind, payload: &[u8]) -> RaftResult<LogOffset> {
        self.ensure_leader()?;
        let index = self.append_entry(
            RaftEntryHeader {
                term: self.state.current_term,
                kind,
                record_offset: self.last_records_end,
            },
            payload,
        )?;
        self.log.flush()?;
        self.advance_commit()?;
        Ok(index)
    }

    /// Propose a membership change
    ///
    /// Returns `None` if the membership already looks as requested.
    pub fn propose_membership_change(
        &mut self,
        change: MembershipChange,
    ) -> RaftResult<Option<LogOffset>> {
        self.ensure_leader()?;
        if self.commit_index < self.term_start_index
            || self.commit_index < self.latest_config_index()
        {
            return Err(RaftError::MembershipChangeInProgress);
        }

        let current = self.latest_membership();
        let mut membership = current.clone();
        match change {
            MembershipChange::Upsert(member) => membership.upsert(member),
            MembershipChange::Remove(id) => {
                if membership.remove(id).is_none() {
                    return Err(RaftError::UnknownMember(id));
                }
            }
        }
        if membership == current {
            return Ok(None);
        }
        if membership.voters().next().is_none() {
            return Err(RaftError::LastVoter);
        }

        info!(members = ?membership.members(), "Proposing membership change");
        self.propose(EntryKind::Config, &encode_membership(&membership))
            .map(Some)
    }

    /// Decide what to send to `peer`
    ///
    /// Returns `None` if we're not a leader, or `peer` is not a member anymore.
    pub fn replication_action(
        &self,
        peer: NodeId,
        last_applied: LogOffset,
    ) -> RaftResult<Option<ReplicationAction>> {
        if self.role != Role::Leader {
            return Ok(None);
        }
        let Some(progress) = self.progress.get(&peer) else {
            return Ok(None);
        };

        let last = self.last_log_index();
        // until the first response, where the follower is is a guess
        let known_end = progress.next_index.prev();
        let lagging = progress.probed
            && self
                .params
                .snapshot_lag_threshold
                .map(|threshold| threshold < last - known_end && known_end < last_applied)
                .unwrap_or(false);

        let prev_log_index = progress.next_index.prev();
        let prev_log_term = match self.term_at(prev_log_index)? {
            Some(term) if !lagging => term,
            _ => return Ok(Some(ReplicationAction::Snapshot)),
        };

        let mut entries = vec![];
        let mut bytes = 0;
        let mut index = progress.next_index;
        while index <= last
            && entries.len() < self.params.max_append_entries
            && bytes < self.params.max_append_bytes
        {
            let (header, payload) = read_entry(&self.log, index)?;
            bytes += payload.len();
            entries.push(PeerEntry::new(header, payload));
            index = index.next();
        }

        Ok(Some(ReplicationAction::Append {
            request: AppendEntries::new(
                self.state.current_term,
                self.id,
                prev_log_index,
                prev_log_term,
                self.commit_index,
                entries,
            ),
            last_sent: index.prev(),
        }))
    }

    /// Returns `true` if the commit index advanced
    pub fn handle_append_response(
        &mut self,
        peer: NodeId,
        resp: AppendEntriesResponse,
        last_sent: LogOffset,
    ) -> RaftResult<bool> {
        if self.state.current_term < resp.term {
            self.become_follower(resp.term, None)?;
            return Ok(false);
        }
        if self.role != Role::Leader || resp.term != self.state.current_term {
            return Ok(false);
        }
        let Some(progress) = self.progress.get_mut(&peer) else {
            return Ok(false);
        };
        progress.probed = true;

        if resp.success {
            progress.match_index = std::cmp::max(progress.match_index, last_sent);
            progress.next_index = progress.match_index.next();
            self.advance_commit()
        } else {
            progress.next_index = std::cmp::max(
                LogOffset(1),
                std::cmp::min(progress.next_index.prev(), resp.last_log_index.next()),
            );
            debug!(%peer, next_index = %progress.next_index, "follower log mismatch");
            Ok(false)
        }
    }

    pub fn handle_snapshot_response(
        &mut self,
        peer: NodeId,
        resp: InstallSnapshotResponse,
        last_included_index: LogOffset,
    ) -> RaftResult<bool> {
        if self.state.current_term < resp.term {
            self.become_follower(resp.term, None)?;
            return Ok(false);
        }
        if self.role != Role::Leader || resp.term != self.state.current_term || !resp.success {
            return Ok(false);
        }
        let Some(progress) = self.progress.get_mut(&peer) else {
            return Ok(false);
        };
        progress.probed = true;
        progress.match_index = std::cmp::max(progress.match_index, last_included_index);
        progress.next_index = progress.match_index.next();
        self.advance_commit()
    }

    /// Commit everything replicated to a majority, as long as it's from our term
    fn advance_commit(&mut self) -> RaftResult<bool> {
        if self.role != Role::Leader {
            return Ok(false);
        }
        let membership = self.committed_membership();
        let mut matches: Vec<LogOffset> = membership
            .voters()
            .map(|m| {
                if m.id == self.id {
                    self.last_log_index()
                } else {
                    self.progress
                        .get(&m.id)
                        .map(|p| p.match_index)
                        .unwrap_or_default()
                }
            })
            .collect();
        if matches.is_empty() {
            return Ok(false);
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[membership.quorum() - 1];

        if self.commit_index < candidate
            && self.term_at(candidate)? == Some(self.state.current_term)
        {
            self.set_commit_index(candidate)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Check the term of an incoming snapshot chunk
    ///
    /// Returns the response to send right away if the chunk must be rejected.
    pub fn accept_snapshot_chunk(
        &mut self,
        term: TermId,
        leader_id: NodeId,
    ) -> RaftResult<Option<InstallSnapshotResponse>> {
        if term < self.state.current_term {
            return Ok(Some(InstallSnapshotResponse {
                term: self.state.current_term,
                success: false,
            }));
        }
        self.become_follower(term, Some(leader_id))?;
        self.last_leader_contact = Some(Instant::now());
        Ok(None)
    }

    /// Is the snapshot ahead of what we've already got
    pub fn needs_snapshot(&self, meta: &SnapshotMeta) -> bool {
        self.commit_index < meta.last_included_index
    }

    /// Adopt a snapshot, after the user log was restored from it
    pub fn install_snapshot(&mut self, meta: SnapshotMeta) -> RaftResult<()> {
        state::save_snapshot_meta(&self.dir, &meta)?;

        let index = meta.last_included_index;
        if self.term_at(index)? == Some(meta.last_included_term) && index < self.last_log_index()
        {
            self.log.truncate(index.next())?;
            let suffix = self.configs.split_off(&index.next());
            self.configs = suffix;
        } else {
            self.log.reset(index.next())?;
            self.configs.clear();
            self.last_records_end = meta.records_end;
        }
        self.configs.insert(index, meta.membership.clone());

        info!(
            last_included_index = %index,
            last_included_term = %meta.last_included_term,
            records_end = %meta.records_end,
            "Snapshot installed"
        );
        self.commit_index = std::cmp::max(self.commit_index, index);
        self.snapshot = Some(meta);
        Ok(())
    }

    /// Describe the applied state at `last_applied`, to be sent as a snapshot
    pub fn snapshot_point(&self, last_applied: LogOffset) -> RaftResult<SnapshotPoint> {
        let (term, records_end) = match &self.snapshot {
            Some(s) if s.last_included_index == last_applied => {
                (s.last_included_term, s.records_end)
            }
            _ => {
                let (header, _) = read_entry(&self.log, last_applied)?;
                (header.term, header.records_end())
            }
        };
        Ok(SnapshotPoint {
            index: last_applied,
            term,
            records_end,
            membership: self.membership_at(last_applied),
        })
    }

    /// Compact the Raft log if enough entries were applied since the last time
    ///
    /// The user log must already be durable up to `last_applied`.
    pub fn maybe_compact(
        &mut self,
        last_applied: LogOffset,
        records_base: LogOffset,
    ) -> RaftResult<bool> {
        let snapshot_index = self.snapshot_index();
        if last_applied <= snapshot_index
            || last_applied - snapshot_index < self.params.snapshot_threshold
        {
            return Ok(false);
        }

        let point = self.snapshot_point(last_applied)?;
        let meta = SnapshotMeta {
            last_included_index: point.index,
            last_included_term: point.term,
            records_base,
            records_end: point.records_end,
            membership: point.membership,
        };
        state::save_snapshot_meta(&self.dir, &meta)?;

        let suffix = self.configs.split_off(&last_applied.next());
        self.configs = suffix;
        self.configs.insert(last_applied, meta.membership.clone());
        self.snapshot = Some(meta);
        self.log.truncate(last_applied.next())?;

        info!(%last_applied, "Raft log compacted");
        Ok(true)
    }
}
