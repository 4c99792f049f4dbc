//! Error-context helpers and value types shared by the napgate crates.

pub mod error;
pub mod types;

pub use {
    error::FromMessage,
    types::{ChatType, ReplyPayload},
};
