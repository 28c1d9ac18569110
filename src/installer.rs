use std::panic;
use std::path::PathBuf;

use flexi_logger::writers::LogWriter;
use flexi_logger::{DeferredNow, Duplicate, FileSpec, Logger, LoggerHandle};
use log::{info, Level, Record};

use crate::capture::{self, Capture, Fault, Severity};
use crate::error::FaultLogError;
use crate::store::ErrorStore;

// Log targets whose records are never captured: the capture path itself and the
// connection pool it writes through.
const IGNORED_TARGETS: [&str; 3] = ["faultlog::store", "faultlog::capture", "r2d2"];

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Keep the default panic output and echo warnings to stderr.
    pub display_errors: bool,
    /// flexi_logger specification; `None` leaves the logging channel unhooked.
    pub log_spec: Option<String>,
    /// Directory for the log file. Defaults to the working directory.
    pub log_dir: Option<PathBuf>,
}

/// Hooks the capture adapters into the process: the panic hook, the logging
/// channel and the shutdown inspection. Done once, at startup.
pub struct Installer {
    store: ErrorStore,
    options: InstallOptions,
}

impl Installer {
    pub fn new(store: ErrorStore, options: InstallOptions) -> Self {
        Installer { store, options }
    }

    pub fn install(self) -> Result<CaptureGuard, FaultLogError> {
        let capture = capture::register(Capture::new(self.store))
            .map_err(|_| FaultLogError::AlreadyInstalled)?;

        let logger = match &self.options.log_spec {
            Some(spec) => Some(Self::start_logger(spec, &self.options)?),
            None => None,
        };

        let display_errors = self.options.display_errors;
        let previous_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            capture.exception(&Fault::from_panic(panic_info));

            if display_errors {
                previous_hook(panic_info);
            }
        }));

        info!(
            "Error capture installed (table '{}' in {})",
            capture.store().table(),
            capture.store().db_path().display()
        );

        Ok(CaptureGuard {
            capture,
            logger,
            finished: false,
        })
    }

    fn start_logger(spec: &str, options: &InstallOptions) -> Result<LoggerHandle, FaultLogError> {
        let mut file_spec = FileSpec::default().basename("faultlog");
        if let Some(dir) = &options.log_dir {
            file_spec = file_spec.directory(dir);
        }

        let duplicate = if options.display_errors {
            Duplicate::Warn
        } else {
            Duplicate::None
        };

        let handle = Logger::try_with_str(spec)?
            .log_to_file_and_writer(file_spec, Box::new(CaptureWriter))
            .format_for_files(flexi_logger::detailed_format)
            .duplicate_to_stderr(duplicate)
            .start()?;

        Ok(handle)
    }
}

/// Owns the installed capture for the lifetime of the process. Shutting it down
/// (explicitly or on drop) runs the fatal-error inspection and flushes the log.
pub struct CaptureGuard {
    capture: &'static Capture,
    logger: Option<LoggerHandle>,
    finished: bool,
}

impl CaptureGuard {
    pub fn capture(&self) -> &'static Capture {
        self.capture
    }

    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.capture.inspect_last_signal() {
            info!("Fatal error recorded at shutdown");
        }

        if let Some(logger) = self.logger.take() {
            logger.flush();
            logger.shutdown();
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Log writer feeding warnings and errors to the runtime-error adapter.
struct CaptureWriter;

impl CaptureWriter {
    fn should_capture(record: &Record) -> bool {
        record.level() <= Level::Warn
            && !IGNORED_TARGETS
                .iter()
                .any(|target| record.target().starts_with(target))
            && !capture::is_capturing()
    }
}

impl LogWriter for CaptureWriter {
    fn write(&self, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
        if !Self::should_capture(record) {
            return Ok(());
        }

        if let Some(capture) = capture::installed() {
            capture.runtime_error(
                Severity::from_level(record.level()),
                &record.args().to_string(),
                record.file().unwrap_or(record.target()),
                record.line().unwrap_or(0),
            );
        }

        Ok(())
    }

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}
