use clap::Parser;
use raftkv::http;
use raftkv::node::Node;
use raftkv_core::{load_config, logging};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "raftkv", about = "A small raft-replicated key/value store node")]
struct Args {
	/// Path to the node's YAML configuration file.
	#[arg(long, default_value = "config.yaml")]
	config: String,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
	logging::init();

	let args = Args::parse();
	let config = match load_config(&args.config) {
		Ok(config) => config,
		Err(err) => {
			error!(%err, path = %args.config, "failed to load configuration");
			return std::process::ExitCode::FAILURE;
		}
	};

	let raft_addr = config.raft.addr();
	let node = match Node::start(config.raft.node_id, &raft_addr, &config.raft.volume_dir).await {
		Ok(node) => Arc::new(node),
		Err(err) => {
			error!(%err, "failed to start node");
			return std::process::ExitCode::FAILURE;
		}
	};

	let http_addr = config.server.addr();
	let listener = match tokio::net::TcpListener::bind(&http_addr).await {
		Ok(listener) => listener,
		Err(err) => {
			error!(%err, addr = %http_addr, "failed to bind http listener");
			return std::process::ExitCode::FAILURE;
		}
	};

	info!(http_addr = %http_addr, raft_addr = %raft_addr, node_id = node.node_id, "raftkv node ready");

	let router = http::router(node.clone());
	let serve_result = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await;

	if let Err(err) = node.shutdown().await {
		error!(%err, "error shutting down raft instance");
	}

	if let Err(err) = serve_result {
		error!(%err, "http server exited with an error");
		return std::process::ExitCode::FAILURE;
	}

	std::process::ExitCode::SUCCESS
}

async fn shutdown_signal() {
	let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler") };

	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
}
