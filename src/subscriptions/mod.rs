//! In-process subscriptions to engine events.
//!
//! Block processing, indexers and API layers can follow epoch lifecycle and
//! finality without polling the engine. Buffers are bounded; a subscriber
//! that falls behind is dropped.
//!
//! # Example
//!
//! ```ignore
//! let handle = manager.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::finality(),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         EngineEvent::Solidified { through, .. } => println!("irreversible up to {}", through),
//!         EngineEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, EngineEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
