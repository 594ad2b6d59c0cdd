//! Background solidify worker.
//!
//! Folding layers into durable storage is the only slow engine operation.
//! The worker runs it off the block-processing thread; requests are executed
//! one at a time, so two folds never race.

use crate::engine::RevokingEngine;
use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

enum Command {
    Solidify {
        count: usize,
        reply: Option<Sender<Result<usize>>>,
    },
    FlushIfNeeded {
        reply: Option<Sender<Result<usize>>>,
    },
    Shutdown,
}

/// Handle to the worker thread. Dropping it stops the worker after the
/// requests already queued.
pub struct Solidifier {
    sender: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Solidifier {
    /// Start a worker that owns a clone of `engine`.
    pub fn spawn<E>(engine: E) -> Result<Self>
    where
        E: RevokingEngine + Clone + 'static,
    {
        let (sender, receiver) = unbounded::<Command>();
        let thread = thread::Builder::new()
            .name("chainkv-solidifier".into())
            .spawn(move || {
                debug!("solidifier started");
                while let Ok(command) = receiver.recv() {
                    let (result, reply) = match command {
                        Command::Solidify { count, reply } => (engine.solidify(count), reply),
                        Command::FlushIfNeeded { reply } => (engine.flush_if_needed(), reply),
                        Command::Shutdown => break,
                    };
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!(error = %e, "background solidify failed");
                            }
                        }
                    }
                }
                debug!("solidifier stopped");
            })?;

        info!("spawned solidifier");
        Ok(Self {
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a fold without waiting for it.
    pub fn request(&self, count: usize) -> Result<()> {
        self.send(Command::Solidify { count, reply: None })
    }

    /// Queue an automatic flush without waiting for it.
    pub fn request_flush(&self) -> Result<()> {
        self.send(Command::FlushIfNeeded { reply: None })
    }

    /// Fold on the worker and wait for the result.
    pub fn solidify(&self, count: usize) -> Result<usize> {
        let (reply, response) = bounded(1);
        self.send(Command::Solidify {
            count,
            reply: Some(reply),
        })?;
        response.recv().map_err(|_| StoreError::WorkerStopped)?
    }

    pub fn flush_if_needed(&self) -> Result<usize> {
        let (reply, response) = bounded(1);
        self.send(Command::FlushIfNeeded { reply: Some(reply) })?;
        response.recv().map_err(|_| StoreError::WorkerStopped)?
    }

    /// Finish queued requests and join the worker.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("solidifier panicked");
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| StoreError::WorkerStopped)
    }
}

impl Drop for Solidifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
