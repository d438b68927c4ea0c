//! Network access to stored readings.
//!
//! [`DataServer`] answers [`protocol`] requests from a shared data store and
//! the retriever's status; [`DataClient`] is the matching client.

pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::DataClient;
pub use protocol::{DataFormat, QueryOptions, Request, Response, ServerInfo};
pub use server::DataServer;
pub use session::SessionManager;
