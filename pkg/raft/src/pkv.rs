//! Persistent KV store (PKV): the durable single-node key/value map used
//! both as the application's data store and as the backing for the FSM.

use raftkv_core::errors::*;
use serde_json::Value;
use std::path::Path;

/// A durable `sled`-backed key/value map. Reads use sled's lock-free,
/// read-only tree lookups; writes go through a single-key transaction that is
/// committed and flushed before `set` returns, so concurrent `set`/`get` on
/// the same key always see either the pre- or post-image, never a partial
/// one.
#[derive(Clone)]
pub struct Pkv {
	tree: sled::Tree,
}

impl Pkv {
	/// Opens (creating if missing) the `pkv` tree inside the sled database at
	/// `dir`.
	pub fn open<P: AsRef<Path>>(dir: P) -> Result<Pkv> {
		let db = sled::open(dir.as_ref())
			.chain_err(|| ErrorKind::Storage(format!("opening pkv at {}", dir.as_ref().display())))?;
		let tree = db
			.open_tree("pkv")
			.chain_err(|| ErrorKind::Storage("opening pkv tree".into()))?;
		Ok(Pkv { tree })
	}

	/// Returns the decoded value previously stored under `key`, or the
	/// empty-object sentinel if `key` is absent or its bytes fail to decode.
	/// Never fails observably; the sentinel is indistinguishable from an
	/// explicitly stored empty object.
	pub fn get(&self, key: &str) -> Value {
		match self.tree.get(key.as_bytes()) {
			Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::Object(Default::default())),
			_ => Value::Object(Default::default()),
		}
	}

	/// JSON-encodes `value` and writes it atomically under `key`. If the
	/// encoded payload is empty, the call is a silent no-op (this cannot
	/// actually happen for `serde_json`-encoded values, but the check is
	/// kept to mirror the documented contract).
	pub fn set(&self, key: &str, value: &Value) -> Result<()> {
		let bytes = serde_json::to_vec(value).chain_err(|| ErrorKind::Decode("encoding value".into()))?;
		if bytes.is_empty() {
			return Ok(());
		}

		self.tree
			.insert(key.as_bytes(), bytes)
			.chain_err(|| ErrorKind::Storage(format!("writing key {}", key)))?;
		self.tree.flush().chain_err(|| ErrorKind::Storage("flushing pkv".into()))?;
		Ok(())
	}

	/// Yields every decoded value currently stored. Skips entries whose bytes
	/// fail to decode rather than failing the whole iteration.
	pub fn get_all(&self) -> Vec<(String, Value)> {
		self.tree
			.iter()
			.filter_map(|res| res.ok())
			.filter_map(|(k, v)| {
				let key = String::from_utf8(k.to_vec()).ok()?;
				let value = serde_json::from_slice(&v).ok()?;
				Some((key, value))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn missing_key_returns_empty_object_sentinel() {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path()).unwrap();
		assert_eq!(pkv.get("missing"), json!({}));
	}

	#[test]
	fn set_then_get_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path()).unwrap();
		pkv.set("foo", &json!("bar")).unwrap();
		assert_eq!(pkv.get("foo"), json!("bar"));
	}

	#[test]
	fn overwrite_replaces_value() {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path()).unwrap();
		pkv.set("k", &json!(1)).unwrap();
		pkv.set("k", &json!(2)).unwrap();
		assert_eq!(pkv.get("k"), json!(2));
	}

	#[test]
	fn get_all_skips_nothing_well_formed() {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path()).unwrap();
		pkv.set("a", &json!(1)).unwrap();
		pkv.set("b", &json!(2)).unwrap();
		let mut all = pkv.get_all();
		all.sort_by(|a, b| a.0.cmp(&b.0));
		assert_eq!(all, vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
	}
}
