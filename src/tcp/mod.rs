//! TCP relay broker.
//!
//! use `Server` to run the broker.
//!
//! use `Client` to register an echo application with a broker.

#[cfg(feature = "server")]
mod allocator;
#[cfg(feature = "server")]
mod forwarder;
#[cfg(feature = "server")]
mod routes;
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{ListenerMode, Server, ServerConfig};

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::Client;
