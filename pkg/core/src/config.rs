use crate::errors::*;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// HTTP listen address for a single endpoint (the client surface or the
/// reserved `leader_server` block).
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
	pub host: String,
	pub port: u16,
}

impl Endpoint {
	pub fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

/// The `raft` block of `config.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftConfig {
	pub node_id: u64,
	pub host: String,
	pub port: u16,
	pub volume_dir: String,
}

impl RaftConfig {
	pub fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

/// The typed form of `config.yaml`, read once at startup and held for the
/// process's lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub server: Endpoint,

	/// Unused at runtime; reserved.
	#[serde(default)]
	pub leader_server: Option<Endpoint>,

	pub raft: RaftConfig,
}

/// Reads and parses `path` (normally `config.yaml` in the working directory,
/// or a path given via `--config`) into a `Config`. Fails fast with
/// `ErrorKind::Config` on any read or parse failure.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
	let path = path.as_ref();
	let contents = fs::read_to_string(path)
		.chain_err(|| ErrorKind::Config(format!("unable to read {}", path.display())))?;

	serde_yaml::from_str(&contents)
		.chain_err(|| ErrorKind::Config(format!("unable to parse {}", path.display())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_a_well_formed_config() {
		let yaml = r#"
server:
  host: 127.0.0.1
  port: 8080
raft:
  node_id: 1
  host: 127.0.0.1
  port: 9090
  volume_dir: /tmp/raftkv
"#;
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.yaml");
		std::fs::write(&path, yaml).unwrap();

		let cfg = load_config(&path).unwrap();
		assert_eq!(cfg.server.addr(), "127.0.0.1:8080");
		assert_eq!(cfg.raft.node_id, 1);
		assert!(cfg.leader_server.is_none());
	}

	#[test]
	fn missing_file_is_a_config_error() {
		let err = load_config("/nonexistent/config.yaml").unwrap_err();
		match err.kind() {
			ErrorKind::Config(_) => {}
			other => panic!("expected ErrorKind::Config, got {:?}", other),
		}
	}
}
