//! # fedstore
//!
//! A federated in-memory key/value object store. Each node keeps its own
//! key → bytes map; nodes join a group of peers; a client's LIST is fanned
//! out across the group while PUT, GET and DELETE stay on the node that
//! received them.
//!
//! ## Modules
//!
//! - [`protocol`]: message types, status codes and the request parser
//! - [`codec`]: line and raw-payload framing over TCP
//! - [`store`]: the concurrent local object map
//! - [`federation`]: peer links, group join and LIST fan-out
//! - [`server`]: the node: accept loop and per-connection handler
//! - [`client`]: synchronous request/acknowledge client
//! - [`config`]: TOML configuration

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod federation;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
