pub mod fsm;
pub mod http;
pub mod network;
pub mod node;
pub mod pkv;
pub mod snapshot_store;
pub mod storage;
pub mod types;
