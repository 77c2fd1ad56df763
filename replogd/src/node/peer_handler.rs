use std::{io, sync::Arc, time::Duration};

use tracing::info;

use crate::task::AutoJoinHandle;

use super::NodeShared;

/// Runs the replication tasks (election timer, applier, replicators)
///
/// Incoming peer RPCs arrive through the request handler; everything
/// this node initiates towards other nodes lives here.
pub struct PeerHandler {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl PeerHandler {
    pub fn new(shared: Arc<NodeShared>) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .thread_name("replogd-raft")
            .enable_all()
            .build()?;

        let join_handle = AutoJoinHandle::spawn_res(
            "peer-handler",
            shared.is_node_shutting_down.clone(),
            move || -> Result<(), io::Error> {
                let _guard = scopeguard::guard((), |_| {
                    info!("PeerHandler is done");
                });

                rt.block_on(async {
                    let guard = shared.panic_guard("raft");
                    shared.raft().clone().run().await;
                    guard.done();
                });

                info!("Waiting for PeerHandler to complete all tasks...");
                rt.shutdown_timeout(Duration::from_secs(10));

                Ok(())
            },
        )?;

        Ok(Self { join_handle })
    }
}
