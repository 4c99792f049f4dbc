//! QQ channel for napgate, talking to a NapCat instance over OneBot v11
//! forward WebSocket.
//!
//! Inbound events flow through [`gateway`] (group gate, owner commands,
//! debounce) into [`handler`] (DM access, media, reply dispatch). Outbound
//! sends go through [`outbound`] on a pooled [`client::WsClient`].

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod faces;
pub mod frame;
pub mod gateway;
pub mod handler;
pub mod inbound;
pub mod media;
pub mod notices;
pub mod outbound;
pub mod plugin;
pub mod policy;
pub mod pool;
pub mod segment;
pub mod setup;
pub mod state;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod testing;

/// Channel id used in config paths, chat ids and session routing.
pub const CHANNEL_ID: &str = "napcatqq";

pub use {
    config::NapCatAccountConfig,
    context::ChannelDeps,
    error::{Error, Result},
    gateway::{AccountRuntime, logout_account, start_account, stop_account},
    plugin::NapCatPlugin,
};
