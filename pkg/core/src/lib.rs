#[macro_use]
extern crate error_chain;

extern crate fs2;

pub mod config;
pub mod errors;
pub mod fs;
pub mod logging;

pub use config::{load_config, Config, Endpoint, RaftConfig};
pub use errors::{Error, ErrorKind, Result, ResultExt};
pub use fs::DirLock;
