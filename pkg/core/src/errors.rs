//! Shared error taxonomy for every crate in the workspace.
//!
//! Every fallible public function in `raftkv-core`, `raftkv` and
//! `raftkv-bootstrap` returns this crate's `Result<T>`. The `ErrorKind`
//! variants correspond one-to-one with the semantic error kinds described in
//! the design: `Config`, `Storage`, `NotLeader`, `Timeout`, `Network`,
//! `Membership` and `Decode`.

error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Json(::serde_json::Error);
		Yaml(::serde_yaml::Error);
		Sled(::sled::Error);
	}

	errors {
		/// The configuration file could not be read or parsed. Fatal at startup.
		Config(msg: String) {
			description("configuration error")
			display("configuration error: {}", msg)
		}

		/// A PKV/LSS/SS I/O failure.
		Storage(msg: String) {
			description("storage error")
			display("storage error: {}", msg)
		}

		/// A write or membership change was attempted on a non-leader node.
		NotLeader(leader_hint: Option<String>) {
			description("not leader")
			display("not leader (hint: {:?})", leader_hint)
		}

		/// An operation did not commit within its deadline. The outcome is
		/// indeterminate, not necessarily failed.
		Timeout(msg: String) {
			description("operation timed out")
			display("operation timed out: {}", msg)
		}

		/// A transient transport failure talking to a peer.
		Network(msg: String) {
			description("network error")
			display("network error: {}", msg)
		}

		/// AddVoter/RemoveServer surfaced a permanent configuration failure.
		Membership(msg: String) {
			description("membership error")
			display("membership error: {}", msg)
		}

		/// Malformed JSON payload in a log entry or a restore stream.
		Decode(msg: String) {
			description("decode error")
			display("decode error: {}", msg)
		}
	}
}
