//! HTTP surface (axum): `/raft/join`, `/raft/stats`, `/store/:key`,
//! `/store`, all wrapped in a single JSON envelope.

use crate::node::Node;
use crate::types::{CommandPayload, NodeId};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use raftkv_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Serialize)]
struct ErrorBody {
	title: String,
	message: String,
}

/// The envelope every response is wrapped in. `r#type` keeps the mislabeled
/// `"Join"` string that `/raft/stats` returns on the wire, preserved for
/// compatibility with existing callers rather than corrected to `"Stats"`.
#[derive(Serialize)]
struct Envelope {
	#[serde(rename = "type")]
	kind: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	data: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<ErrorBody>,
}

impl Envelope {
	fn ok(kind: &'static str, data: Value) -> Response {
		Json(Envelope { kind, data: Some(data), error: None }).into_response()
	}

	fn err(err: Error) -> Response {
		let title = error_title(err.kind());
		Json(Envelope { kind: "Error", data: None, error: Some(ErrorBody { title: title.to_string(), message: err.to_string() }) })
			.into_response()
	}
}

fn error_title(kind: &ErrorKind) -> &'static str {
	match kind {
		ErrorKind::NotLeader(_) => "not leader",
		ErrorKind::Membership(_) => "membership error",
		ErrorKind::Timeout(_) => "timeout",
		ErrorKind::Storage(_) => "storage error",
		ErrorKind::Network(_) => "network error",
		ErrorKind::Decode(_) => "decode error",
		ErrorKind::Config(_) => "configuration error",
		_ => "error",
	}
}

pub fn router(node: Arc<Node>) -> Router {
	Router::new()
		.route("/raft/join", post(join))
		.route("/raft/stats", get(stats))
		.route("/store/:key", get(get_key))
		.route("/store", post(set_key))
		.with_state(node)
}

#[derive(Deserialize)]
struct JoinRequest {
	node_id: NodeId,
	raft_address: String,
}

async fn join(State(node): State<Arc<Node>>, Json(req): Json<JoinRequest>) -> Response {
	if req.raft_address.is_empty() {
		return Envelope::err(ErrorKind::Membership("raft_address must not be empty".into()).into());
	}
	match node.join(req.node_id, req.raft_address).await {
		Ok(()) => Envelope::ok("Join", serde_json::json!({})),
		Err(err) => Envelope::err(err),
	}
}

async fn stats(State(node): State<Arc<Node>>) -> Response {
	let stats = node.stats();
	Envelope::ok("Join", serde_json::to_value(stats).unwrap_or(Value::Null))
}

async fn get_key(State(node): State<Arc<Node>>, Path(key): Path<String>) -> Response {
	match node.do_operation(CommandPayload::get(key)).await {
		Ok(value) => Envelope::ok("Get", value.unwrap_or(Value::Object(Default::default()))),
		Err(err) => Envelope::err(err),
	}
}

#[derive(Deserialize)]
struct SetRequest {
	key: String,
	value: Value,
}

async fn set_key(State(node): State<Arc<Node>>, Json(req): Json<SetRequest>) -> Response {
	match node.do_operation(CommandPayload::set(req.key, req.value)).await {
		Ok(value) => Envelope::ok("Set", value.unwrap_or(Value::Null)),
		Err(err) => Envelope::err(err),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn success_envelope_serializes_without_error_field() {
		let body = Envelope { kind: "Join", data: Some(serde_json::json!({})), error: None };
		let value = serde_json::to_value(&body).unwrap();
		assert_eq!(value["type"], "Join");
		assert_eq!(value["data"], serde_json::json!({}));
		assert!(value.get("error").is_none());
	}

	#[test]
	fn stats_envelope_keeps_the_mislabeled_join_type() {
		let body = Envelope { kind: "Join", data: Some(serde_json::json!({"state": "Leader"})), error: None };
		let value = serde_json::to_value(&body).unwrap();
		assert_eq!(value["type"], "Join");
	}

	#[test]
	fn not_leader_maps_to_expected_title() {
		assert_eq!(error_title(&ErrorKind::NotLeader(None)), "not leader");
	}

	#[test]
	fn membership_error_message_is_preserved() {
		let err: Error = ErrorKind::Membership("boom".into()).into();
		assert!(err.to_string().contains("boom"));
	}
}
