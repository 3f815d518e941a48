//! Bidirectional, auto-reconnecting RPC transport carrying the agent
//! protocol (`next`, `wait`, `extend`, `update`, `upload`, `log`, `done`).

mod client;
mod error;
mod proto;
mod server;
pub mod wire;

pub use client::{Client, ClientConfig};
pub use error::RpcError;
pub use proto::{Request, Response, ResponseError};
pub use server::{dispatch, Handler};
