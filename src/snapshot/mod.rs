//! Layered snapshot engine.
//!
//! Each registered store is a chain: a root layer over durable storage, then
//! one in-memory delta layer per open epoch, newest on top. Writers only touch
//! the head. `solidify` folds the oldest deltas into the root, `revoke` drops
//! the head, and cursors let readers start from a layer below the head.
//!
//! ```text
//! root(R) <- delta(R+1) <- ... <- delta(R+n) = head
//!             ^ solid marker          ^ pbft marker
//! ```
//!
//! `previous` links are strong and `next` links are weak, so a revoked layer
//! lives only as long as some reader still holds it.

mod chain;
mod layer;
mod manager;
mod view;

pub use chain::Chain;
pub use layer::Layer;
pub use manager::SnapshotManager;
pub use view::View;
