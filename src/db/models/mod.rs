//! Data models held by the event store.

pub mod event;

pub use self::event::*;
