//! The `openraft` type configuration and the wire types the core works with.

use openraft::{BasicNode, Entry, TokioRuntime};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// The replicated unit. `operation` is matched case-insensitively (normalized
/// by trimming whitespace and upper-casing before dispatch); `value` is
/// absent for `GET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
	pub operation: String,
	pub key: String,
	#[serde(default)]
	pub value: Option<serde_json::Value>,
}

impl CommandPayload {
	pub fn set(key: impl Into<String>, value: serde_json::Value) -> Self {
		CommandPayload { operation: "SET".into(), key: key.into(), value: Some(value) }
	}

	pub fn get(key: impl Into<String>) -> Self {
		CommandPayload { operation: "GET".into(), key: key.into(), value: None }
	}

	/// Trims whitespace and upper-cases `operation` so dispatch is
	/// case-insensitive.
	pub fn normalized_operation(&self) -> String {
		self.operation.trim().to_uppercase()
	}
}

/// What the FSM hands back to the replication engine after `Apply`. `None`
/// for non-command entries, unknown operations, and any storage/decode error
/// the FSM swallows internally (logged, not raised, since a failed apply
/// must never wedge the log).
pub type FsmResponse = Option<serde_json::Value>;

pub type NodeId = u64;

openraft::declare_raft_types!(
	pub TypeConfig:
		D = CommandPayload,
		R = FsmResponse,
		NodeId = NodeId,
		Node = BasicNode,
		Entry = Entry<TypeConfig>,
		SnapshotData = Cursor<Vec<u8>>,
		AsyncRuntime = TokioRuntime,
);

pub type RaftInstance = openraft::Raft<TypeConfig>;
