use serde::Serialize;

/// Marker stored in the trace column when no stack trace could be captured.
pub const TRACE_NOT_AVAILABLE: &str = "N/A";

// Column widths of the persisted schema
pub const MESSAGE_MAX: usize = 1000;
pub const FILE_MAX: usize = 1000;
pub const RUNTIME_ERROR_MESSAGE_MAX: usize = 1000;
pub const TRACE_MAX: usize = 2000;
pub const EXCEPTION_MESSAGE_MAX: usize = 1000;
pub const REMOTE_ADDRESS_MAX: usize = 256;

/// A captured failure that has not been written yet.
///
/// The store assigns the id, the write time and the remote address, so none of
/// those can be supplied here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewErrorRecord {
    message: String,
    file: String,
    line: i64,
    runtime_error_message: String,
    trace: String,
    exception_message: String,
}

impl NewErrorRecord {
    pub fn new(
        message: impl Into<String>,
        file: impl Into<String>,
        line: i64,
        trace: impl Into<String>,
        exception_message: impl Into<String>,
    ) -> Self {
        NewErrorRecord {
            message: clip(message.into(), MESSAGE_MAX),
            file: clip(file.into(), FILE_MAX),
            line,
            runtime_error_message: String::new(),
            trace: clip(trace.into(), TRACE_MAX),
            exception_message: clip(exception_message.into(), EXCEPTION_MESSAGE_MAX),
        }
    }

    /// Builds a record from values that may be missing. Absent text becomes an empty
    /// string, an absent trace becomes the "not available" marker and an absent line
    /// becomes 0.
    pub fn from_parts(
        message: Option<&str>,
        file: Option<&str>,
        line: Option<u32>,
        trace: Option<String>,
        exception_message: Option<&str>,
    ) -> Self {
        Self::new(
            message.unwrap_or_default(),
            file.unwrap_or_default(),
            line.map(i64::from).unwrap_or(0),
            trace.unwrap_or_else(|| TRACE_NOT_AVAILABLE.to_owned()),
            exception_message.unwrap_or_default(),
        )
    }

    pub fn with_runtime_error_message(mut self, runtime_error_message: impl Into<String>) -> Self {
        self.runtime_error_message = clip(runtime_error_message.into(), RUNTIME_ERROR_MESSAGE_MAX);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> i64 {
        self.line
    }

    pub fn runtime_error_message(&self) -> &str {
        &self.runtime_error_message
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn exception_message(&self) -> &str {
        &self.exception_message
    }
}

/// One row of the error log as read back from the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub message: String,
    pub file: String,
    pub line: i64,
    pub log_time: i64,
    pub runtime_error_message: String,
    pub trace: String,
    pub exception_message: String,
    pub remote_address: String,
}

/// Truncates `value` to at most `max` bytes without splitting a character.
pub fn clip(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut end = max;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}
