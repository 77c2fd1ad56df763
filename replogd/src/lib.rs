#![deny(clippy::as_conversions)]

pub mod auth;
pub mod config;
mod ioutil;
pub mod log;
mod node;
pub mod raft;
mod segment;
mod task;
pub mod tls;

pub use node::*;
pub use raft::{RaftParams, Role, RoleState};
