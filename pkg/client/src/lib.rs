//! Bootstrap Client (BC): a single-shot coordinator, run outside the
//! cluster process, that finds the current leader among a configured set
//! of peers and asks every other peer to join it.

#[macro_use]
extern crate error_chain;

pub mod errors;

use errors::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One cluster member as configured for the bootstrap run.
#[derive(Debug, Clone, Deserialize)]
pub struct Peer {
	pub node_id: u64,
	pub raft_address: String,
	pub http_address: String,
}

#[derive(Deserialize)]
struct StatsResponse {
	data: StatsData,
}

#[derive(Deserialize)]
struct StatsData {
	state: String,
}

#[derive(Serialize)]
struct JoinRequest<'a> {
	node_id: u64,
	raft_address: &'a str,
}

/// Everything the bootstrap algorithm needs from the network, kept small
/// enough that a circuit breaker could wrap an implementation later without
/// touching [`find_leader`]/[`run`], and so tests can swap in a fake.
pub trait Transport {
	async fn stat(&self, http_address: &str, stat_path: &str) -> Result<String>;
	async fn join(&self, leader_http_address: &str, join_path: &str, node_id: u64, raft_address: &str) -> Result<()>;
}

pub struct HttpClient {
	client: reqwest::Client,
}

impl HttpClient {
	pub fn new() -> Result<HttpClient> {
		let client = reqwest::Client::builder()
			.connect_timeout(TLS_HANDSHAKE_TIMEOUT)
			.timeout(REQUEST_TIMEOUT)
			.build()?;
		Ok(HttpClient { client })
	}
}

impl Transport for HttpClient {
	async fn stat(&self, http_address: &str, stat_path: &str) -> Result<String> {
		let correlation_id = correlation_id();
		let url = format!("{}{}", http_address, stat_path);
		let response = self
			.client
			.get(&url)
			.header("x-correlation-id", &correlation_id)
			.send()
			.await?
			.json::<StatsResponse>()
			.await?;
		Ok(response.data.state)
	}

	async fn join(&self, leader_http_address: &str, join_path: &str, node_id: u64, raft_address: &str) -> Result<()> {
		let correlation_id = correlation_id();
		let url = format!("{}{}", leader_http_address, join_path);
		self.client
			.post(&url)
			.header("x-correlation-id", &correlation_id)
			.json(&JoinRequest { node_id, raft_address })
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

/// Opaque per-call correlation id; wall-clock nanoseconds are sufficient
/// since these only need to be unique enough to grep a log by.
fn correlation_id() -> String {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_nanos().to_string())
		.unwrap_or_else(|_| "0".to_string())
}

/// Polls every peer's stats endpoint in configured order and returns the
/// first one reporting `"Leader"`. Peers that don't answer are skipped, not
/// retried.
pub async fn find_leader<T: Transport>(transport: &T, peers: &[Peer], stat_path: &str) -> Option<Peer> {
	for peer in peers {
		match transport.stat(&peer.http_address, stat_path).await {
			Ok(state) if state == "Leader" => return Some(peer.clone()),
			Ok(_) => {}
			Err(err) => warn!(peer = %peer.http_address, %err, "stat probe failed"),
		}
	}
	None
}

/// Runs the full bootstrap algorithm: find the leader, then sequentially
/// ask every other configured peer to join it. Individual join failures are
/// logged and skipped; this function itself never fails.
pub async fn run<T: Transport>(transport: &T, peers: &[Peer], stat_path: &str, join_path: &str) {
	let Some(leader) = find_leader(transport, peers, stat_path).await else {
		warn!("no peer reported itself as leader; nothing to join");
		return;
	};
	info!(leader = %leader.http_address, "selected leader");

	for peer in peers {
		if peer.node_id == leader.node_id {
			continue;
		}
		match transport.join(&leader.http_address, join_path, peer.node_id, &peer.raft_address).await {
			Ok(()) => info!(node_id = peer.node_id, "joined cluster"),
			Err(err) => warn!(node_id = peer.node_id, %err, "join failed, continuing"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::sync::Mutex;

	fn peer(id: u64, http: &str) -> Peer {
		Peer { node_id: id, raft_address: format!("127.0.0.1:{}", 9000 + id), http_address: http.to_string() }
	}

	struct FakeTransport {
		states: HashMap<String, String>,
		joins: Mutex<Vec<(String, u64)>>,
	}

	impl FakeTransport {
		fn new(states: &[(&str, &str)]) -> FakeTransport {
			FakeTransport {
				states: states.iter().map(|(addr, state)| (addr.to_string(), state.to_string())).collect(),
				joins: Mutex::new(Vec::new()),
			}
		}
	}

	impl Transport for FakeTransport {
		async fn stat(&self, http_address: &str, _stat_path: &str) -> Result<String> {
			self.states.get(http_address).cloned().ok_or_else(|| "unknown peer".into())
		}

		async fn join(&self, leader_http_address: &str, _join_path: &str, node_id: u64, _raft_address: &str) -> Result<()> {
			self.joins.lock().unwrap().push((leader_http_address.to_string(), node_id));
			Ok(())
		}
	}

	#[tokio::test]
	async fn leader_selection_picks_first_reporting_leader_among_mixed_states() {
		let peers = vec![peer(1, "http://a"), peer(2, "http://b"), peer(3, "http://c")];
		let transport = FakeTransport::new(&[("http://a", "Follower"), ("http://b", "Leader"), ("http://c", "Candidate")]);
		let leader = find_leader(&transport, &peers, "/raft/stats").await;
		assert_eq!(leader.unwrap().node_id, 2);
	}

	#[tokio::test]
	async fn all_followers_report_non_leader_yields_none() {
		let peers = vec![peer(1, "http://a"), peer(2, "http://b")];
		let transport = FakeTransport::new(&[("http://a", "Follower"), ("http://b", "Follower")]);
		assert!(find_leader(&transport, &peers, "/raft/stats").await.is_none());
	}

	#[tokio::test]
	async fn run_joins_every_peer_except_the_leader() {
		let peers = vec![peer(1, "http://a"), peer(2, "http://b"), peer(3, "http://c")];
		let transport = FakeTransport::new(&[("http://a", "Follower"), ("http://b", "Leader"), ("http://c", "Follower")]);
		run(&transport, &peers, "/raft/stats", "/raft/join").await;

		let joins = transport.joins.lock().unwrap();
		assert_eq!(joins.len(), 2);
		assert!(joins.iter().all(|(leader, _)| leader == "http://b"));
		let joined_ids: Vec<u64> = joins.iter().map(|(_, id)| *id).collect();
		assert_eq!(joined_ids, vec![1, 3]);
	}

	#[tokio::test]
	async fn run_with_no_leader_issues_no_joins() {
		let peers = vec![peer(1, "http://a"), peer(2, "http://b")];
		let transport = FakeTransport::new(&[("http://a", "Follower"), ("http://b", "Follower")]);
		run(&transport, &peers, "/raft/stats", "/raft/join").await;
		assert!(transport.joins.lock().unwrap().is_empty());
	}

	#[test]
	fn stats_response_decodes_leader_state() {
		let body = r#"{"type":"Join","data":{"state":"Leader"}}"#;
		let parsed: StatsResponse = serde_json::from_str(body).unwrap();
		assert_eq!(parsed.data.state, "Leader");
	}

	#[test]
	fn join_request_serializes_expected_fields() {
		let req = JoinRequest { node_id: 3, raft_address: "127.0.0.1:9003" };
		let value = serde_json::to_value(&req).unwrap();
		assert_eq!(value["node_id"], 3);
		assert_eq!(value["raft_address"], "127.0.0.1:9003");
	}
}
