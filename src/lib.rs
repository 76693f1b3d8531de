// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # wasp-nest
//!
//! Controller for Wasp agents. Agents connect over TCP, negotiate a
//! per-direction stream cipher, describe themselves, and are then tasked from
//! a durable per-agent queue that an operator fills independently.
//!
//! ## Architecture
//!
//! - **Protocol** (`protocol`): handshake, XOR-stream cipher, length-prefixed
//!   JSON frames, chunked payload sub-protocol
//! - **Commands** (`command`): verb registry and the built-in command types
//! - **Store** (`store`): agent identities, task queue, response log,
//!   collection directory
//! - **Sessions** (`session`, `server`): per-connection state machine and the
//!   accept loop
//! - **Operator** (`operator`): selection and submission facade
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wasp_nest::command::{Command, CommandRegistry, Execute};
//! use wasp_nest::operator::Operator;
//! use wasp_nest::paths::NestPaths;
//! use wasp_nest::store::AgentStore;
//!
//! let store = AgentStore::open(
//!     NestPaths::resolve().unwrap(),
//!     Arc::new(CommandRegistry::with_builtins()),
//! )
//! .unwrap();
//! let mut operator = Operator::new(store);
//! operator.select_agent("abc123").unwrap();
//! operator.submit(Command::new(Execute::new("uname -a"))).unwrap();
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod operator;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
