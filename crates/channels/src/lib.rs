//! Channel building blocks shared by chat platform integrations.
//!
//! A channel crate (the QQ/NapCat one in this workspace) implements the
//! [`ChannelPlugin`] family of traits and talks to the agent host through
//! [`host::ChannelHost`] and [`pairing::PairingStore`]. The buffers in
//! [`history`] and [`debounce`] hold per-chat state between inbound events.

pub mod commands;
pub mod debounce;
pub mod error;
pub mod gating;
pub mod history;
pub mod host;
pub mod pairing;
pub mod plugin;

pub use {
    error::{Error, Result},
    plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus},
};
