//! Shared types and utilities for the chatsync client and its tests.

pub mod error;
pub mod frame;
pub mod models;
pub mod protocol;

pub use error::*;
pub use frame::*;
pub use models::*;
pub use protocol::*;
