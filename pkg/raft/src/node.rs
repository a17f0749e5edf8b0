//! Node Service (NS): the public surface wiring PKV, LSS, SS, NT and the
//! replication engine together, plus the Join/Remove/Stats/DoOperation/
//! Shutdown operations exposed over HTTP.

use crate::fsm::Fsm;
use crate::network::{self, NtNetworkFactory};
use crate::pkv::Pkv;
use crate::snapshot_store::SnapshotStore;
use crate::storage::{self, RaftStore};
use crate::types::{CommandPayload, FsmResponse, NodeId, RaftInstance};
use openraft::{BasicNode, Config as RaftConfig};
use raftkv_core::errors::*;
use raftkv_core::DirLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const APPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// A running node: the `openraft` instance plus the resources a correct
/// shutdown needs to release (the directory lock outlives everything else,
/// dropped last).
pub struct Node {
	pub node_id: NodeId,
	pub raft: RaftInstance,
	_lock: DirLock,
}

impl Node {
	/// Opens (or creates) every on-disk resource under `volume_dir`, binds
	/// the raft transport, and self-bootstraps a single-voter cluster if the
	/// log is empty. Every node starts this way; membership only grows
	/// through later [`Node::join`] calls made against the current leader.
	pub async fn start(node_id: NodeId, raft_bind_addr: &str, volume_dir: &str) -> Result<Node> {
		let lock = DirLock::open(volume_dir).chain_err(|| ErrorKind::Storage("locking volume_dir".into()))?;

		let pkv = Pkv::open(format!("{}/pkv", volume_dir))?;
		let fsm = Arc::new(Fsm::new(pkv));
		let snapshots = Arc::new(SnapshotStore::open(format!("{}/snapshots", volume_dir))?);
		let store = RaftStore::open(format!("{}/raft.dataRepo", volume_dir), fsm, snapshots)?;
		let (log_store, state_machine) = storage::into_adapted(store);

		let config = Arc::new(RaftConfig { snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(1024), ..Default::default() }
			.validate()
			.chain_err(|| ErrorKind::Config("invalid raft config".into()))?);

		let network = NtNetworkFactory::default();
		let raft = RaftInstance::new(node_id, config, network, log_store, state_machine)
			.await
			.chain_err(|| ErrorKind::Storage("constructing raft instance".into()))?;

		let listen_raft = raft.clone();
		let bind_addr = raft_bind_addr.to_string();
		tokio::spawn(async move {
			if let Err(err) = network::serve(&bind_addr, listen_raft).await {
				warn!(%err, "raft transport listener exited");
			}
		});

		let mut initial_members = BTreeMap::new();
		initial_members.insert(node_id, BasicNode::new(raft_bind_addr));
		match raft.initialize(initial_members).await {
			Ok(()) => info!(node_id, "bootstrapped single-voter cluster"),
			Err(err) if err.to_string().contains("NotAllowed") => {
				info!(node_id, "node already bootstrapped, skipping initialize")
			}
			Err(err) => return Err(ErrorKind::Storage(format!("bootstrapping cluster: {}", err)).into()),
		}

		Ok(Node { node_id, raft, _lock: lock })
	}

	async fn is_leader(&self) -> bool {
		self.raft.metrics().borrow().current_leader == Some(self.node_id)
	}

	/// Adds `node_id`/`raft_address` to the cluster. Any existing entry whose
	/// id or address collides with the new one but isn't an exact match is
	/// removed first; an exact-match entry already present is treated as
	/// success.
	pub async fn join(&self, node_id: NodeId, raft_address: String) -> Result<()> {
		if !self.is_leader().await {
			return Err(ErrorKind::NotLeader(None).into());
		}

		let members = self.raft.metrics().borrow().membership_config.membership().nodes().map(|(id, node)| (*id, node.clone())).collect::<Vec<_>>();

		for (existing_id, existing_node) in &members {
			let same_id = *existing_id == node_id;
			let same_addr = existing_node.addr == raft_address;
			if same_id && same_addr {
				return Ok(());
			}
			if same_id || same_addr {
				let mut remaining: std::collections::BTreeSet<NodeId> =
					members.iter().map(|(id, _)| *id).collect();
				remaining.remove(existing_id);
				self.raft
					.change_membership(remaining, false)
					.await
					.chain_err(|| ErrorKind::Membership(format!("removing colliding node {}", existing_id)))?;
			}
		}

		self.raft
			.add_learner(node_id, BasicNode::new(&raft_address), true)
			.await
			.chain_err(|| ErrorKind::Membership(format!("adding learner {}", node_id)))?;

		let mut voters: std::collections::BTreeSet<NodeId> =
			self.raft.metrics().borrow().membership_config.membership().voter_ids().collect();
		voters.insert(node_id);
		self.raft
			.change_membership(voters, false)
			.await
			.chain_err(|| ErrorKind::Membership(format!("adding voter {}", node_id)))?;

		Ok(())
	}

	/// Removes `node_id` from the voting configuration. Unlike [`Node::join`],
	/// this only ever removes the named node.
	pub async fn remove(&self, node_id: NodeId) -> Result<()> {
		if !self.is_leader().await {
			return Err(ErrorKind::NotLeader(None).into());
		}

		let mut voters: std::collections::BTreeSet<NodeId> =
			self.raft.metrics().borrow().membership_config.membership().voter_ids().collect();
		voters.remove(&node_id);
		self.raft
			.change_membership(voters, false)
			.await
			.chain_err(|| ErrorKind::Membership(format!("removing node {}", node_id)))?;
		Ok(())
	}

	/// A best-effort, instantaneous snapshot of the node's raft state: current
	/// term, commit index, last log index, last applied, state name,
	/// num_peers, and the latest configuration index.
	pub fn stats(&self) -> HashMap<String, String> {
		let metrics = self.raft.metrics().borrow().clone();
		let mut out = HashMap::new();
		out.insert("state".to_string(), format!("{:?}", metrics.state));
		out.insert("term".to_string(), metrics.current_term.to_string());
		out.insert("commit_index".to_string(), metrics.committed.map(|id| id.index.to_string()).unwrap_or_default());
		out.insert("last_log_index".to_string(), metrics.last_log_index.map(|i| i.to_string()).unwrap_or_default());
		out.insert("last_applied".to_string(), metrics.last_applied.map(|id| id.index.to_string()).unwrap_or_default());
		let num_peers = metrics.membership_config.membership().voter_ids().filter(|id| *id != self.node_id).count();
		out.insert("num_peers".to_string(), num_peers.to_string());
		out.insert(
			"configuration_index".to_string(),
			metrics.membership_config.log_id().map(|log_id| log_id.index.to_string()).unwrap_or_default(),
		);
		out
	}

	/// Runs `payload` through the replicated log and returns the FSM's
	/// result. Leader-only; does not forward to the current leader.
	pub async fn do_operation(&self, payload: CommandPayload) -> Result<FsmResponse> {
		if !self.is_leader().await {
			return Err(ErrorKind::NotLeader(None).into());
		}

		let result = tokio::time::timeout(APPLY_TIMEOUT, self.raft.client_write(payload)).await;
		match result {
			Ok(Ok(response)) => Ok(response.data),
			// `is_leader()` above is a stale read of the metrics channel; RE
			// itself rejects the write authoritatively if leadership slipped
			// in the meantime. Surface that race as `NotLeader`, not as a
			// membership error.
			Ok(Err(openraft::error::RaftError::APIError(openraft::error::ClientWriteError::ForwardToLeader(_)))) => {
				Err(ErrorKind::NotLeader(None).into())
			}
			Ok(Err(err)) => Err(ErrorKind::Membership(err.to_string()).into()),
			Err(_) => Err(ErrorKind::Timeout("do_operation did not commit in time".into()).into()),
		}
	}

	pub async fn shutdown(&self) -> Result<()> {
		self.raft.shutdown().await.chain_err(|| ErrorKind::Storage("shutting down raft".into()))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	/// Binds an ephemeral port and releases it immediately, so a test can hand
	/// the address to `Node::start` without a fixed, possibly-taken port.
	fn free_addr() -> String {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		listener.local_addr().unwrap().to_string()
	}

	async fn wait_for_leader(node: &Node) {
		for _ in 0..50 {
			if node.is_leader().await {
				return;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		panic!("node did not become leader in time");
	}

	#[tokio::test]
	async fn single_node_set_then_get_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let addr = free_addr();
		let node = Node::start(1, &addr, dir.path().to_str().unwrap()).await.unwrap();
		wait_for_leader(&node).await;

		let set = node.do_operation(CommandPayload::set("foo", json!("bar"))).await.unwrap();
		assert_eq!(set, Some(json!("bar")));

		let get = node.do_operation(CommandPayload::get("foo")).await.unwrap();
		assert_eq!(get, Some(json!("bar")));

		assert_eq!(node.stats().get("num_peers").map(String::as_str), Some("0"));
	}

	#[tokio::test]
	async fn restart_rebootstraps_from_existing_volume_dir_without_error() {
		let dir = tempfile::tempdir().unwrap();
		let addr = free_addr();
		let volume_dir = dir.path().to_str().unwrap();

		let node = Node::start(1, &addr, volume_dir).await.unwrap();
		wait_for_leader(&node).await;
		node.do_operation(CommandPayload::set("k", json!(1))).await.unwrap();
		node.shutdown().await.unwrap();

		// `BootstrapCluster` on an already-initialized node is benign, not an
		// error, per §4.6.
		let restarted = Node::start(1, &addr, volume_dir).await.unwrap();
		wait_for_leader(&restarted).await;
		let get = restarted.do_operation(CommandPayload::get("k")).await.unwrap();
		assert_eq!(get, Some(json!(1)));
	}
}
