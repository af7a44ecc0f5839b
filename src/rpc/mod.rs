//! Line-delimited JSON RPC between the interpreter and the process that
//! owns the automation session.

pub mod client;
pub mod remote;
pub mod server;
pub mod wire;

pub use client::RpcClient;
pub use remote::RemoteBackend;
pub use server::RpcServer;
