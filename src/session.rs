//! Epoch sessions.
//!
//! A session owns the epoch it opened. Unless it is committed or merged, the
//! epoch is revoked when the session ends, so a block whose execution fails
//! leaves nothing behind in the head.

use crate::engine::RevokingEngine;
use crate::error::{Result, StoreError};
use crate::types::Epoch;
use tracing::{debug, warn};

/// Guard over one open epoch of a [`RevokingEngine`].
///
/// ```ignore
/// let session = Session::begin(&engine)?;
/// account.put(b"alice", b"100")?;
/// session.commit();
/// ```
#[must_use = "dropping a session revokes its epoch"]
pub struct Session<'a, E: RevokingEngine + ?Sized> {
    engine: &'a E,
    epoch: Epoch,
    active: bool,
}

impl<'a, E: RevokingEngine + ?Sized> Session<'a, E> {
    /// Open a new epoch on every store.
    pub fn begin(engine: &'a E) -> Result<Self> {
        let epoch = engine.advance_all()?;
        debug!(epoch = epoch.0, "session started");
        Ok(Self {
            engine,
            epoch,
            active: true,
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Keep the epoch open for a later solidify.
    pub fn commit(mut self) -> Epoch {
        self.active = false;
        self.epoch
    }

    /// Fold the epoch into the one below it, as a nested transaction commit.
    pub fn merge(mut self) -> Result<Epoch> {
        self.ensure_head()?;
        self.active = false;
        self.engine.merge()
    }

    /// Discard the epoch now.
    pub fn revoke(mut self) -> Result<()> {
        self.ensure_head()?;
        self.active = false;
        self.engine.revoke().map(|_| ())
    }

    fn ensure_head(&self) -> Result<()> {
        let head = self.engine.head_epoch();
        if head != self.epoch {
            return Err(StoreError::violation(format!(
                "session epoch {} is not the head ({})",
                self.epoch, head
            )));
        }
        Ok(())
    }
}

impl<E: RevokingEngine + ?Sized> Drop for Session<'_, E> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = self.ensure_head() {
            warn!(epoch = self.epoch.0, error = %e, "abandoned session left open");
            return;
        }
        match self.engine.revoke() {
            Ok(epoch) => debug!(epoch = epoch.0, "session revoked on drop"),
            Err(e) => warn!(epoch = self.epoch.0, error = %e, "revoke on drop failed"),
        }
    }
}

/// Run `f` inside a fresh epoch. On `Err` the epoch is revoked in full; on
/// `Ok` it stays open.
///
/// The block's own error is returned even if the revoke fails; that failure is
/// logged.
pub fn execute<E, T, F>(engine: &E, f: F) -> Result<T>
where
    E: RevokingEngine + ?Sized,
    F: FnOnce(&E) -> Result<T>,
{
    let session = Session::begin(engine)?;
    match f(engine) {
        Ok(value) => {
            session.commit();
            Ok(value)
        }
        Err(e) => {
            let epoch = session.epoch();
            if let Err(revoke_error) = session.revoke() {
                warn!(
                    epoch = epoch.0,
                    error = %e,
                    revoke_error = %revoke_error,
                    "failed block left its epoch open"
                );
            }
            Err(e)
        }
    }
}
