//! Logging and progress output for a squash run.
//!
//! [`Notifier`] installs an `env_logger` backend for the `log` facade, filtered
//! by a single verbosity switch, and in quiet mode renders an `indicatif`
//! spinner and per-layer progress bars instead of text logs. Everything is
//! written to stderr, leaving stdout free for the output archive.
//!
//! Levels:
//! - [`VerbosityLevel::Quiet`] → warnings and errors only, plus spinner/bars.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → text logs.
//!
//! `RUST_LOG` still overrides the filter for individual modules.

use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0,
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    multi_progress: Option<MultiProgress>,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    /// Creates a notifier and installs the global logger. Installing is a
    /// no-op when a logger is already set, so several notifiers may coexist
    /// (as they do in tests).
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let _ = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .format_timestamp(None)
            .try_init();

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            multi_progress,
            active_spinner: RefCell::new(None),
        }
    }

    pub fn info(&self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                if self.active_spinner.borrow().is_none() {
                    if let Some(multi_progress) = &self.multi_progress {
                        let spinner = multi_progress.add(ProgressBar::new_spinner());
                        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                            spinner.set_style(style);
                        }
                        spinner.enable_steady_tick(Duration::from_millis(100));
                        *self.active_spinner.borrow_mut() = Some(spinner);
                    }
                }
                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            _ => log::info!("{}", message),
        }
    }

    pub fn debug(&self, message: &str) {
        log::debug!("{}", message);
    }

    pub fn warn(&self, message: &str) {
        self.suspend(|| log::warn!("{}", message));
    }

    pub fn trace(&self, message: &str) {
        log::trace!("{}", message);
    }

    /// A progress bar in quiet mode; `None` when text logs are active.
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        let multi_progress = self.multi_progress.as_ref()?;
        let progress_bar = multi_progress.add(ProgressBar::new(length));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}")
        {
            progress_bar.set_style(style.progress_chars("=> "));
        }
        progress_bar.set_message(message.to_string());
        Some(progress_bar)
    }

    /// Per-step progress for text mode.
    pub fn progress(&self, current: u64, total: u64, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.info(&format!("{}: {}/{}", message, current, total));
        }
    }

    /// Stops and clears the spinner.
    pub fn finish(&self) {
        if let Some(spinner) = self.active_spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }

    fn suspend<F: FnOnce()>(&self, f: F) {
        match &self.multi_progress {
            Some(multi_progress) => multi_progress.suspend(f),
            None => f(),
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Logs an unrecoverable condition and terminates the process.
pub fn fatal(message: &str) -> ! {
    log::error!("{}", message);
    std::process::exit(1)
}
