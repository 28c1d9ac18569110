use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::Cell;
use std::error::Error;
use std::panic::{Location, PanicHookInfo};
use std::sync::Mutex;

use log::debug;
use once_cell::sync::OnceCell;
use strum::{AsRefStr, Display};

use crate::record::{NewErrorRecord, TRACE_NOT_AVAILABLE};
use crate::store::ErrorStore;

static CAPTURE: OnceCell<Capture> = OnceCell::new();

thread_local! {
    // Set while a record is being written so that anything the write itself logs
    // is not captured again.
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

// Clears IN_CAPTURE on every exit path, unwinding included
struct CaptureFlagReset;

impl Drop for CaptureFlagReset {
    fn drop(&mut self) {
        IN_CAPTURE.with(|flag| flag.set(false));
    }
}

/// How serious a failure signal is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Severity {
    Notice,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn from_level(level: log::Level) -> Self {
        match level {
            log::Level::Error => Severity::Error,
            log::Level::Warn => Severity::Warning,
            _ => Severity::Notice,
        }
    }
}

/// A failure notification as retained for shutdown inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl Signal {
    pub fn new(severity: Severity, message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Signal {
            severity,
            message: message.into(),
            file: file.into(),
            line,
        }
    }
}

/// An uncaught failure: what a panic (or any error escaping to the top) looks like
/// to the exception adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub trace: Option<String>,
}

impl Fault {
    pub fn from_panic(info: &PanicHookInfo) -> Self {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        Fault {
            message,
            file: info.location().map(|l| l.file().to_owned()),
            line: info.location().map(|l| l.line()),
            trace: captured_trace(),
        }
    }

    /// Describes `err` and its chain of sources, located at the caller.
    #[track_caller]
    pub fn from_error(err: &dyn Error) -> Self {
        let location = Location::caller();

        Fault {
            message: error_chain(err),
            file: Some(location.file().to_owned()),
            line: Some(location.line()),
            trace: captured_trace(),
        }
    }
}

fn captured_trace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The capture adapters, bound to one store.
///
/// Every adapter swallows persistence failures: a broken error log must never
/// change the behavior of the program it is watching.
pub struct Capture {
    store: ErrorStore,
    last_signal: Mutex<Option<Signal>>,
}

impl Capture {
    pub fn new(store: ErrorStore) -> Self {
        Capture {
            store,
            last_signal: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ErrorStore {
        &self.store
    }

    fn persist(&self, record: &NewErrorRecord) -> bool {
        if IN_CAPTURE.with(|flag| flag.replace(true)) {
            return false;
        }
        let _reset = CaptureFlagReset;

        let ok = self.store.append(record);
        if !ok {
            debug!("Failed to record error '{}' from {}", record.exception_message(), record.file());
        }
        ok
    }

    /// Explicit report of a condition the application handled itself.
    pub fn report(
        &self,
        message: &str,
        file: &str,
        line: i64,
        trace: &str,
        exception_message: &str,
    ) -> bool {
        self.persist(&NewErrorRecord::new(message, file, line, trace, exception_message))
    }

    /// Explicit report of an error value, located at the caller.
    #[track_caller]
    pub fn report_error(&self, err: &dyn Error, message: &str) -> bool {
        let fault = Fault::from_error(err);
        self.persist(&NewErrorRecord::from_parts(
            Some(message),
            fault.file.as_deref(),
            fault.line,
            fault.trace,
            Some(&fault.message),
        ))
    }

    /// Non-fatal error from the logging channel. Always reports the signal as handled,
    /// whether or not it could be stored.
    pub fn runtime_error(&self, severity: Severity, message: &str, file: &str, line: u32) -> bool {
        self.retain(Signal::new(severity, message, file, line));

        let record = NewErrorRecord::new(
            message,
            file,
            i64::from(line),
            TRACE_NOT_AVAILABLE,
            format!("Runtime error! Severity = {}", severity),
        )
        .with_runtime_error_message(message);

        let _ = self.persist(&record);
        true
    }

    /// Uncaught failure, typically a panic.
    pub fn exception(&self, fault: &Fault) {
        self.retain(Signal::new(
            Severity::Error,
            fault.message.clone(),
            fault.file.clone().unwrap_or_default(),
            fault.line.unwrap_or(0),
        ));

        let _ = self.persist(&NewErrorRecord::from_parts(
            Some(""),
            fault.file.as_deref(),
            fault.line,
            fault.trace.clone(),
            Some(&fault.message),
        ));
    }

    /// Marks the process as dying from `message`. It is recorded by the shutdown
    /// inspection, not immediately.
    #[track_caller]
    pub fn raise_fatal(&self, message: &str) {
        let location = Location::caller();
        self.retain(Signal::new(Severity::Fatal, message, location.file(), location.line()));
    }

    /// Shutdown inspection of the last retained signal. Only a fatal signal produces
    /// a record; returns whether one was stored.
    pub fn shutdown(&self, last: Option<&Signal>) -> bool {
        match last {
            Some(signal) if signal.severity == Severity::Fatal => self.persist(&NewErrorRecord::new(
                signal.message.clone(),
                signal.file.clone(),
                i64::from(signal.line),
                TRACE_NOT_AVAILABLE,
                format!("Fatal error! Severity = {}", signal.severity),
            )),
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Runs the shutdown inspection against the retained signal, consuming it so the
    /// inspection happens at most once.
    pub fn inspect_last_signal(&self) -> bool {
        let last = match self.last_signal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.shutdown(last.as_ref())
    }

    fn retain(&self, signal: Signal) {
        match self.last_signal.lock() {
            Ok(mut guard) => *guard = Some(signal),
            Err(poisoned) => *poisoned.into_inner() = Some(signal),
        }
    }
}

/// Registers the process-wide capture. Fails if one is already registered.
pub(crate) fn register(capture: Capture) -> Result<&'static Capture, Capture> {
    CAPTURE.try_insert(capture).map_err(|(_, rejected)| rejected)
}

/// The process-wide capture, if installed.
pub fn installed() -> Option<&'static Capture> {
    CAPTURE.get()
}

/// Explicit report through the installed capture. Returns `false` if nothing is
/// installed or the record could not be stored.
pub fn report(message: &str, file: &str, line: i64, trace: &str, exception_message: &str) -> bool {
    installed()
        .map(|capture| capture.report(message, file, line, trace, exception_message))
        .unwrap_or(false)
}

/// True while this thread is writing a record.
pub(crate) fn is_capturing() -> bool {
    IN_CAPTURE.with(|flag| flag.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{temp_store, unreachable_store};
    use pretty_assertions::assert_eq;
    use std::io;

    #[test]
    fn test_severity_names() {
        assert_eq!(Severity::Warning.to_string(), "WARNING");
        assert_eq!(Severity::Fatal.as_ref(), "FATAL");
        assert_eq!(Severity::from_level(log::Level::Error), Severity::Error);
        assert_eq!(Severity::from_level(log::Level::Warn), Severity::Warning);
        assert_eq!(Severity::from_level(log::Level::Info), Severity::Notice);
    }

    #[test]
    fn test_explicit_report_is_stored() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        assert!(capture.report("disk full", "worker.go", 42, "n/a", ""));

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "disk full");
        assert_eq!(records[0].line, 42);
    }

    #[test]
    fn test_report_error_uses_caller_location_and_chain() {
        #[derive(Debug)]
        struct Outer(io::Error);

        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "could not read settings")
            }
        }

        impl Error for Outer {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());
        let err = Outer(io::Error::new(io::ErrorKind::NotFound, "settings.toml missing"));

        let line = line!() + 1;
        assert!(capture.report_error(&err, "startup"));

        let record = &store.read_all().unwrap()[0];
        assert_eq!(record.message, "startup");
        assert_eq!(record.exception_message, "could not read settings: settings.toml missing");
        assert!(record.file.ends_with("capture.rs"));
        assert_eq!(record.line, i64::from(line));
        assert!(record.trace == TRACE_NOT_AVAILABLE || record.trace.contains("report_error"));
    }

    #[test]
    fn test_runtime_error_always_handled() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        assert!(capture.runtime_error(Severity::Warning, "slow disk", "io.rs", 12));

        let record = &store.read_all().unwrap()[0];
        assert_eq!(record.message, "slow disk");
        assert_eq!(record.runtime_error_message, "slow disk");
        assert_eq!(record.exception_message, "Runtime error! Severity = WARNING");
        assert_eq!(record.trace, TRACE_NOT_AVAILABLE);

        let broken = Capture::new(unreachable_store());
        assert!(broken.runtime_error(Severity::Error, "lost", "io.rs", 13));
    }

    #[test]
    fn test_runtime_error_is_retained_as_last_signal() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store);

        capture.runtime_error(Severity::Error, "first", "a.rs", 1);
        capture.runtime_error(Severity::Warning, "second", "b.rs", 2);

        assert_eq!(
            capture.last_signal(),
            Some(Signal::new(Severity::Warning, "second", "b.rs", 2))
        );
    }

    #[test]
    fn test_exception_records_fault() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        capture.exception(&Fault {
            message: "index out of bounds".to_string(),
            file: Some("src/lib.rs".to_string()),
            line: Some(99),
            trace: None,
        });

        let record = &store.read_all().unwrap()[0];
        assert_eq!(record.message, "");
        assert_eq!(record.exception_message, "index out of bounds");
        assert_eq!(record.file, "src/lib.rs");
        assert_eq!(record.line, 99);
        assert_eq!(record.trace, TRACE_NOT_AVAILABLE);
    }

    #[test]
    fn test_exception_swallows_store_failure() {
        let capture = Capture::new(unreachable_store());
        capture.exception(&Fault {
            message: "boom".to_string(),
            file: None,
            line: None,
            trace: None,
        });
    }

    #[test]
    fn test_shutdown_captures_only_fatal() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        assert!(!capture.shutdown(None));
        for severity in [Severity::Notice, Severity::Warning, Severity::Error] {
            assert!(!capture.shutdown(Some(&Signal::new(severity, "not fatal", "x.rs", 1))));
        }
        assert!(store.read_all().unwrap().is_empty());

        assert!(capture.shutdown(Some(&Signal::new(Severity::Fatal, "out of memory", "alloc.rs", 5))));

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "out of memory");
        assert_eq!(records[0].exception_message, "Fatal error! Severity = FATAL");
    }

    #[test]
    fn test_raise_fatal_is_recorded_by_inspection_once() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        capture.raise_fatal("config unreadable");
        assert!(store.read_all().unwrap().is_empty());

        assert!(capture.inspect_last_signal());
        assert!(!capture.inspect_last_signal());

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].file.ends_with("capture.rs"));
    }

    #[test]
    fn test_later_non_fatal_signal_replaces_fatal() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        capture.raise_fatal("dying");
        capture.runtime_error(Severity::Warning, "cleanup warning", "c.rs", 3);

        assert!(!capture.inspect_last_signal());
    }

    #[test]
    fn test_nested_capture_is_suppressed() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        IN_CAPTURE.with(|flag| flag.set(true));
        assert!(!capture.report("nested", "n.rs", 1, "N/A", ""));
        IN_CAPTURE.with(|flag| flag.set(false));

        assert!(store.read_all().unwrap().is_empty());
        assert!(!is_capturing());
    }
}
