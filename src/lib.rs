//! This crate provides an Internet Free/Busy (IFB) gateway in front of a CalDAV groupware server.
//!
//! Desktop mail clients can look up the availability of attendees through a URL template such as
//! `http://127.0.0.1:7778/ifb/freebusy/%NAME%@%SERVER%.vfb`. The [`Gateway`] listens on the loopback
//! interface, resolves the requested identifier to a server user with the help of a cached copy of
//! the address book (see the [`cache`] module), and fetches free/busy data from the server (see the
//! [`resolver`] module).
//!
//! Talking to the server is done through the [`Upstream`](traits::Upstream) trait, which is implemented
//! over HTTP by the [`client`] module.

pub mod traits;
pub mod error;
pub use error::GatewayError;
pub mod config;
pub use config::{GatewayConfiguration, GatewaySettings};

pub mod client;
pub use client::Client;
pub mod directory;
pub mod cache;
pub use cache::AddressBook;
pub mod ical;
pub mod resolver;
pub use resolver::{FreeBusyOutcome, FreeBusyQuery, FreeBusyResolver};
pub mod gateway;
pub use gateway::Gateway;

pub mod utils;

#[cfg(test)]
mod mock_upstream;
