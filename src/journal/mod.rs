//! Undo-log engine.
//!
//! One physical store per name, written in place. While epochs are open every
//! write first records the value it overwrites, so an epoch can be revoked by
//! replaying its log strictly newest-first. Solidify only forgets logs.
//!
//! Compared with the layered engine this keeps no copies of changed values in
//! memory beyond the prior values, at the cost of logging every write. It
//! suits shallow fork windows with high churn.

mod manager;

pub use manager::{JournalStore, UndoLogManager};
