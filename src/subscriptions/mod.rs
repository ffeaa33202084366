//! Change notifications for reactive consumers.
//!
//! Bindings publish events as their in-memory state changes and as writes
//! land, are blocked, or fail. A UI layer subscribes and re-reads the
//! binding it cares about.
//!
//! Subscriptions support:
//! - Filtering by logical key
//! - Bounded buffers with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let handle = cache.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::keys(vec!["app_goals".to_string()]),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(CacheEvent::Changed { key }) => println!("{key} changed"),
//!         Ok(CacheEvent::Dropped { .. }) => break,
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    CacheEvent, DropReason, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
