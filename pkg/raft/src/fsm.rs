//! Finite State Machine (FSM): applies committed commands against the PKV.

use crate::pkv::Pkv;
use crate::types::{CommandPayload, FsmResponse};
use raftkv_core::errors::*;
use std::io::Read;
use tracing::warn;

/// Owns no state of its own beyond the PKV handle; `apply` is invoked
/// serially, in committed-index order, by the storage layer.
pub struct Fsm {
	pkv: Pkv,
}

impl Fsm {
	pub fn new(pkv: Pkv) -> Fsm {
		Fsm { pkv }
	}

	/// Dispatches one committed command. Storage/decode failures are logged
	/// and swallowed (returning `None`) rather than propagated, so a single
	/// bad entry never wedges the apply loop.
	pub fn apply(&self, payload: &CommandPayload) -> FsmResponse {
		match payload.normalized_operation().as_str() {
			"SET" => {
				let value = payload.value.clone().unwrap_or(serde_json::Value::Null);
				match self.pkv.set(&payload.key, &value) {
					Ok(()) => Some(value),
					Err(err) => {
						warn!(key = %payload.key, %err, "pkv set failed during apply");
						None
					}
				}
			}
			"GET" => Some(self.pkv.get(&payload.key)),
			other => {
				warn!(operation = %other, "unknown operation during apply");
				None
			}
		}
	}

	/// Replays a stream of JSON-encoded `CommandPayload` objects, each
	/// written with `PKV.set`. Additive: keys not touched by the stream are
	/// left as they are. Any decode or store failure aborts the restore.
	pub fn restore(&self, mut stream: impl Read) -> Result<()> {
		let mut bytes = Vec::new();
		stream.read_to_end(&mut bytes).chain_err(|| ErrorKind::Storage("reading restore stream".into()))?;
		if bytes.is_empty() {
			return Ok(());
		}

		let stream = serde_json::Deserializer::from_slice(&bytes).into_iter::<CommandPayload>();
		for payload in stream {
			let payload = payload.chain_err(|| ErrorKind::Decode("decoding restore entry".into()))?;
			let value = payload.value.unwrap_or(serde_json::Value::Null);
			self.pkv.set(&payload.key, &value)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn fsm() -> (tempfile::TempDir, Fsm) {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path()).unwrap();
		(dir, Fsm::new(pkv))
	}

	#[test]
	fn set_stores_and_echoes_value() {
		let (_dir, fsm) = fsm();
		let result = fsm.apply(&CommandPayload::set("k", json!(42)));
		assert_eq!(result, Some(json!(42)));
		assert_eq!(fsm.pkv.get("k"), json!(42));
	}

	#[test]
	fn get_reads_back_stored_value() {
		let (_dir, fsm) = fsm();
		fsm.apply(&CommandPayload::set("k", json!("v")));
		assert_eq!(fsm.apply(&CommandPayload::get("k")), Some(json!("v")));
	}

	#[test]
	fn unknown_operation_returns_none() {
		let (_dir, fsm) = fsm();
		let payload = CommandPayload { operation: "DELETE".into(), key: "k".into(), value: None };
		assert_eq!(fsm.apply(&payload), None);
	}

	#[test]
	fn operation_matching_is_case_and_whitespace_insensitive() {
		let (_dir, fsm) = fsm();
		let payload = CommandPayload { operation: "  get  ".into(), key: "k".into(), value: None };
		assert_eq!(fsm.apply(&payload), Some(json!({})));
	}

	#[test]
	fn restore_replays_concatenated_payloads_additively() {
		let (_dir, fsm) = fsm();
		fsm.apply(&CommandPayload::set("existing", json!("kept")));

		let mut stream = Vec::new();
		serde_json::to_writer(&mut stream, &CommandPayload::set("a", json!(1))).unwrap();
		serde_json::to_writer(&mut stream, &CommandPayload::set("b", json!(2))).unwrap();

		fsm.restore(stream.as_slice()).unwrap();

		assert_eq!(fsm.pkv.get("a"), json!(1));
		assert_eq!(fsm.pkv.get("b"), json!(2));
		assert_eq!(fsm.pkv.get("existing"), json!("kept"));
	}

	#[test]
	fn restore_of_empty_stream_is_a_no_op() {
		let (_dir, fsm) = fsm();
		fsm.restore(&[][..]).unwrap();
	}
}
