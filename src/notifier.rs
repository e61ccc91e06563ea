//! Progress UI.
//!
//! [`Notifier`] wraps `indicatif` under a single verbosity switch:
//! - [`VerbosityLevel::Quiet`] → a live spinner for the current phase and one
//!   progress bar per layer pipeline.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → nothing
//!   visual; messages go to the `log` facade instead.
//!
//! The notifier is `Send + Sync`, so resolver threads and pipeline workers can
//! share one instance behind an `Arc`.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner and bars, no text logs
    Info = 1,  // Text logs at info level
    Debug = 2, // Text logs at debug level
    Trace = 3, // Text logs at trace level
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
    pub fn to_log_level(self) -> LevelFilter {
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
    active_spinner: Mutex<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);
        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            multi_progress,
            active_spinner: Mutex::new(None),
        }
    }

    pub fn info(&self, message: &str) {
        let Some(multi_progress) = &self.multi_progress else {
            log::info!("{}", message);
            return;
        };

        let Ok(mut active) = self.active_spinner.lock() else {
            return;
        };
        let spinner = active.get_or_insert_with(|| {
            let style = ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            let spinner = multi_progress.add(ProgressBar::new_spinner());
            spinner.set_style(style);
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        });
        spinner.set_message(message.to_string());
    }

    /// A bar counting fetched layers, only in [`VerbosityLevel::Quiet`] mode.
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        let multi_progress = self.multi_progress.as_ref()?;
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} layers ({elapsed})",
            )
            .map(|s| s.progress_chars("=> "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let progress_bar = multi_progress.add(ProgressBar::new(length));
        progress_bar.set_style(style);
        progress_bar.set_message(message.to_string());
        Some(progress_bar)
    }

    /// Clears the spinner before results are printed.
    pub fn finish(&self) {
        if let Ok(mut active) = self.active_spinner.lock() {
            if let Some(spinner) = active.take() {
                spinner.finish_and_clear();
            }
        }
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        self.verbosity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(VerbosityLevel::from(0), VerbosityLevel::Quiet);
        assert_eq!(VerbosityLevel::from(2), VerbosityLevel::Debug);
        assert_eq!(VerbosityLevel::from(9), VerbosityLevel::Trace);
        assert_eq!(VerbosityLevel::Quiet.to_log_level(), LevelFilter::Warn);
        assert_eq!(VerbosityLevel::Info.to_log_level(), LevelFilter::Info);
    }

    #[test]
    fn test_progress_bars_only_when_quiet() {
        let verbose = Notifier::new(1);
        assert_eq!(verbose.verbosity(), VerbosityLevel::Info);
        assert!(verbose.create_progress_bar(3, "layers").is_none());

        let quiet = Notifier::new(0);
        assert_eq!(quiet.verbosity(), VerbosityLevel::Quiet);
        let bar = quiet.create_progress_bar(3, "layers").unwrap();
        assert_eq!(bar.length(), Some(3));
        quiet.finish();
    }

    #[test]
    fn test_notifier_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Notifier>();
    }
}
