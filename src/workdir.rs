//! Scratch directory that is removed however the run ends.
//!
//! A [`WorkDir`] owns a fresh temporary directory and a cleanup thread. On
//! SIGINT, SIGTERM or SIGHUP the signal thread raises the shared
//! [`Cancellation`] so the pipeline stops writing at its next check, and the
//! cleanup thread waits for the pipeline to hand the directory back. Either
//! way the directory is removed exactly once, after the main flow is done
//! with it. Finishing joins the cleanup thread; after a signal the process
//! then exits with the conventional `128 + signo` status. A second signal
//! while the pipeline is still busy removes the directory and exits at once.

use crate::cancel::Cancellation;
use crate::error::{IoContext, SquashError, SquashResult};
use crate::notifier;
use crate::tree;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

const TEMP_PREFIX: &str = "imgsquash";
const WAKE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Wake {
    Signal(i32),
    /// Cleanup requested without exiting the process.
    Interrupted,
    Finished,
}

#[derive(Debug)]
struct Guard {
    wake: SyncSender<Wake>,
    signals: Handle,
    cleanup: Option<JoinHandle<Option<i32>>>,
}

#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    cancel: Cancellation,
    guard: Option<Guard>,
}

impl WorkDir {
    /// Creates the directory under `parent` (the system temp dir when
    /// `None`) and, unless `keep` is set, arms the cleanup thread for it.
    pub fn create(keep: bool, parent: Option<&Path>) -> SquashResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX);
        let temp = match parent {
            Some(parent) => builder
                .tempdir_in(parent)
                .with_path("Failed to create temporary directory in", parent)?,
            None => builder
                .tempdir()
                .io_context("Failed to create temporary directory")?,
        };
        let path = temp.keep();
        let cancel = Cancellation::new();

        if keep {
            log::info!("Keeping temporary directory {}", path.display());
            return Ok(Self {
                path,
                cancel,
                guard: None,
            });
        }
        log::debug!("Using temporary directory {}", path.display());

        let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
            Ok(signals) => signals,
            Err(e) => {
                if let Err(cleanup) = tree::remove_tree(&path) {
                    log::warn!("Failed to remove {}: {}", path.display(), cleanup);
                }
                return Err(SquashError::io("Failed to install signal handlers", e));
            }
        };
        let handle = signals.handle();
        let (wake, waiter) = mpsc::sync_channel(WAKE_CAPACITY);

        let forward = wake.clone();
        let raised = cancel.clone();
        thread::spawn(move || {
            for signal in signals.forever() {
                raised.cancel(signal);
                if forward.send(Wake::Signal(signal)).is_err() {
                    break;
                }
            }
        });

        let dir = path.clone();
        let cleanup = thread::spawn(move || wait_and_clean(&dir, waiter));

        Ok(Self {
            path,
            cancel,
            guard: Some(Guard {
                wake,
                signals: handle,
                cleanup: Some(cleanup),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flag raised when a termination signal arrives.
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Removes the directory as if the run had been interrupted, without
    /// exiting the process. The caller must have stopped writing into it.
    pub fn interrupt(&self) {
        if let Some(guard) = &self.guard {
            let _ = guard.wake.try_send(Wake::Interrupted);
        }
    }

    /// Removes the directory and waits until it is gone. Exits the process
    /// if a termination signal arrived during the run.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        let _ = guard.wake.send(Wake::Finished);
        let signal = match guard.cleanup.take().map(JoinHandle::join) {
            Some(Ok(signal)) => signal,
            Some(Err(_)) => {
                log::error!("Cleanup of {} panicked", self.path.display());
                None
            }
            None => None,
        };
        guard.signals.close();
        if let Some(signal) = signal {
            log::warn!("Interrupted by signal {signal}");
            std::process::exit(128 + signal);
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        self.release();
    }
}

/// Waits until the main flow is done with `dir`, removes it and returns the
/// signal that interrupted the run, if any.
fn wait_and_clean(dir: &Path, waiter: Receiver<Wake>) -> Option<i32> {
    let mut interrupted_by = None;
    loop {
        match waiter.recv().unwrap_or(Wake::Finished) {
            Wake::Signal(signal) if interrupted_by.is_none() => {
                log::warn!("Received signal {signal}, stopping");
                interrupted_by = Some(signal);
            }
            Wake::Signal(signal) => {
                log::warn!("Received signal {signal} again, cleaning up now");
                remove_or_die(dir);
                std::process::exit(128 + signal);
            }
            Wake::Interrupted | Wake::Finished => break,
        }
    }
    remove_or_die(dir);
    interrupted_by
}

fn remove_or_die(dir: &Path) {
    log::debug!("Removing temporary directory {}", dir.display());
    if let Err(e) = tree::remove_tree(dir) {
        notifier::fatal(&format!(
            "Failed to remove temporary directory {}: {}",
            dir.display(),
            e
        ));
    }
}
