mod common;

use common::*;
use replog::{Consistency, Error, LogOffset, NodeId};
use replogd::{RaftParams, Role};
use std::time::Duration;

#[test]
fn records_replicate_to_all_nodes() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let leader = cluster.node(cluster.wait_for_leader()?);

    let mut client = leader.new_client()?;
    for i in 0u8..20 {
        assert_eq!(client.produce(&[i])?, LogOffset(u64::from(i)));
    }

    for node in &cluster.nodes {
        node.wait_for_records(20)?;
        let mut client = node.new_client()?;
        for i in 0u8..20 {
            assert_eq!(
                client.consume(LogOffset(u64::from(i)), Consistency::Relaxed)?,
                [i]
            );
        }
    }

    Ok(())
}

#[test]
fn followers_redirect_to_the_leader() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let leader_id = cluster.wait_for_leader()?;
    let leader = cluster.node(leader_id);
    let follower = cluster
        .nodes
        .iter()
        .find(|node| node.id() != leader_id)
        .expect("3 nodes");
    follower.wait_for_role(Role::Follower)?;

    let mut client = follower.new_client()?;
    match client.produce(b"x") {
        Err(Error::NotLeader { leader: Some(addr) }) => assert_eq!(addr, leader.addr()),
        other => panic!("unexpected: {other:?}"),
    }
    match client.consume(LogOffset(0), Consistency::Strong) {
        Err(Error::NotLeader { leader: Some(addr) }) => assert_eq!(addr, leader.addr()),
        other => panic!("unexpected: {other:?}"),
    }
    match client.join(NodeId(9), "127.0.0.1:1", true) {
        Err(e @ Error::NotLeader { .. }) => assert_eq!(e.leader(), Some(leader.addr().as_str())),
        other => panic!("unexpected: {other:?}"),
    }

    Ok(())
}

#[test]
fn get_servers_lists_the_cluster() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let leader_id = cluster.wait_for_leader()?;

    let mut client = cluster.node(leader_id).new_client()?;
    let servers = client.get_servers()?;
    assert_eq!(servers.len(), 3);
    for (server, id) in servers.iter().zip(1..) {
        assert_eq!(server.member.id, NodeId(id));
        assert_eq!(server.member.addr(), cluster.node(NodeId(id)).addr());
        assert!(server.member.voter);
        assert_eq!(server.is_leader, server.member.id == leader_id);
    }

    Ok(())
}

#[test]
fn new_leader_after_leader_stops() -> anyhow::Result<()> {
    let mut cluster = TestCluster::new(3)?;
    let old_leader_id = cluster.wait_for_leader()?;

    {
        let mut client = cluster.node(old_leader_id).new_client()?;
        for i in 0u8..10 {
            client.produce(&[i])?;
        }
    }
    for node in &cluster.nodes {
        node.wait_for_records(10)?;
    }

    cluster.node_mut(old_leader_id).stop();

    let new_leader_id = cluster.wait_for_leader()?;
    assert_ne!(new_leader_id, old_leader_id);
    let new_leader = cluster.node(new_leader_id);

    let mut client = new_leader.new_client()?;
    for i in 0u8..10 {
        assert_eq!(
            client.consume(LogOffset(u64::from(i)), Consistency::Strong)?,
            [i]
        );
    }
    assert_eq!(client.produce(b"after failover")?, LogOffset(10));

    // the old leader catches up after coming back, as a follower
    let old_leader = cluster.node_mut(old_leader_id);
    old_leader.restart()?;
    old_leader.wait_for_records(11)?;
    assert_eq!(
        old_leader
            .new_client()?
            .consume(LogOffset(10), Consistency::Relaxed)?,
        b"after failover"
    );

    Ok(())
}

#[test]
fn no_commit_without_majority() -> anyhow::Result<()> {
    let mut cluster = TestCluster::new(3)?;
    let leader_id = cluster.wait_for_leader()?;
    let followers: Vec<_> = cluster
        .nodes
        .iter()
        .map(TestNode::id)
        .filter(|id| *id != leader_id)
        .collect();

    for id in &followers {
        cluster.node_mut(*id).stop();
    }

    let leader = cluster.node(leader_id);
    let addr = leader.addr();
    let handle = std::thread::spawn(move || {
        let mut client = replog::std::RawClient::connect(&addr)?;
        client.produce(b"lonely")
    });

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(leader.ctrl().records_end(), LogOffset(0));

    cluster.node_mut(followers[0]).restart()?;
    // committed once a majority is back, or failed if the leader changed meanwhile
    match handle.join().expect("no panic") {
        Ok(offset) => assert_eq!(offset, LogOffset(0)),
        Err(Error::LeadershipLost { .. }) => {}
        Err(e) => panic!("unexpected: {e}"),
    }

    Ok(())
}

#[test]
fn leave_removes_a_member() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let leader_id = cluster.wait_for_leader()?;
    let leaving = cluster
        .nodes
        .iter()
        .map(TestNode::id)
        .find(|id| *id != leader_id)
        .expect("3 nodes");

    let mut client = cluster.node(leader_id).new_client()?;
    client.leave(leaving)?;

    let servers = client.get_servers()?;
    assert_eq!(servers.len(), 2);
    assert!(servers.iter().all(|s| s.member.id != leaving));

    // still making progress with two voters
    assert_eq!(client.produce(b"after leave")?, LogOffset(0));

    Ok(())
}

#[test]
fn non_voter_receives_records() -> anyhow::Result<()> {
    let cluster = TestCluster::new(1)?;
    let leader = &cluster.nodes[0];
    let learner = TestNode::new(2)?;
    join(leader, &learner, false)?;

    let mut client = leader.new_client()?;
    client.produce(b"hello")?;

    learner.wait_for_records(1)?;
    assert_eq!(
        learner
            .new_client()?
            .consume(LogOffset(0), Consistency::Relaxed)?,
        b"hello"
    );
    // never campaigns, even though nobody but the leader talks to it
    assert_eq!(learner.role(), Role::Follower);

    let servers = client.get_servers()?;
    assert!(!servers[1].member.voter);

    Ok(())
}

#[test]
fn lagging_node_catches_up_through_snapshot() -> anyhow::Result<()> {
    let small_snapshots = |params: &mut replogd::Parameters| {
        params.raft = RaftParams::builder()
            .heartbeat_interval(Duration::from_millis(20))
            .election_timeout_min(Duration::from_millis(150))
            .election_timeout_max(Duration::from_millis(300))
            .rpc_timeout(Duration::from_millis(500))
            .snapshot_threshold(16)
            .snapshot_chunk_size(256)
            .build();
        params.max_store_bytes = 1024;
    };
    let cluster = TestCluster::new_with(1, small_snapshots)?;
    let leader = &cluster.nodes[0];

    let mut client = leader.new_client()?;
    for i in 0u8..100 {
        client.produce(&[i; 32])?;
    }

    // the beginning of the log is long gone, only a snapshot can help
    let late = TestNode::new_with(2, false, small_snapshots)?;
    join(leader, &late, true)?;
    late.wait_for_records(100)?;

    let mut late_client = late.new_client()?;
    for i in 0u8..100 {
        assert_eq!(
            late_client.consume(LogOffset(u64::from(i)), Consistency::Relaxed)?,
            [i; 32]
        );
    }

    // and regular replication continues from there
    client.produce(b"tail")?;
    late.wait_for_records(101)?;
    assert_eq!(
        late_client.consume(LogOffset(100), Consistency::Relaxed)?,
        b"tail"
    );

    Ok(())
}
