use clap::Parser;
use raftkv_bootstrap::{run, HttpClient, Peer};
use raftkv_core::logging;
use serde::Deserialize;
use std::fs;
use tracing::error;

#[derive(Parser)]
#[command(name = "raftkv-bootstrap", about = "Finds the cluster leader and joins the rest of the peers to it")]
struct Args {
	/// Path to the bootstrap run's YAML configuration file.
	#[arg(long, default_value = "bootstrap.yaml")]
	config: String,
}

#[derive(Deserialize)]
struct BootstrapConfig {
	peers: Vec<Peer>,
	#[serde(default = "default_stat_path")]
	stat_path: String,
	#[serde(default = "default_join_path")]
	join_path: String,
	/// Reserved for a future `Remove` run; unused today.
	#[allow(dead_code)]
	#[serde(default)]
	remove_path: Option<String>,
}

fn default_stat_path() -> String {
	"/raft/stats".to_string()
}

fn default_join_path() -> String {
	"/raft/join".to_string()
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
	logging::init();

	let args = Args::parse();
	let config: BootstrapConfig = match fs::read_to_string(&args.config).ok().and_then(|s| serde_yaml::from_str(&s).ok())
	{
		Some(config) => config,
		None => {
			error!(path = %args.config, "failed to load bootstrap configuration");
			return std::process::ExitCode::FAILURE;
		}
	};

	let client = match HttpClient::new() {
		Ok(client) => client,
		Err(err) => {
			error!(%err, "failed to construct http client");
			return std::process::ExitCode::FAILURE;
		}
	};

	run(&client, &config.peers, &config.stat_path, &config.join_path).await;
	std::process::ExitCode::SUCCESS
}
