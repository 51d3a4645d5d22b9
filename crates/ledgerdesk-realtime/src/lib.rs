//! In-process change feed.
//!
//! Writers publish a [`Change`](ledgerdesk_types::events::Change) after their
//! storage write commits; readers register an observer for one
//! [`Topic`](ledgerdesk_types::events::Topic) and get back a [`Subscription`]
//! that unregisters when cancelled or dropped.

pub mod feed;

pub use feed::{ChangeFeed, Subscription};
