use std::fmt::Write;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use log::{debug, Level};
use logging_timer::timer;
use tabled::{builder::Builder, settings::Style};

use crate::capture::Capture;
use crate::config::ReportConfig;
use crate::record::ErrorRecord;
use crate::store::ErrorStore;

pub const NO_ERRORS_NOTICE: &str = "No error occurred so far :)";
pub const RETRIEVAL_FAILED_NOTICE: &str = "Error logs could not be retrieved.";
pub const LOGGING_FAILED_NOTICE: &str = "Even error logging failed!";

const COLUMNS: [&str; 9] = [
    "Error ID",
    "Message",
    "Exception message",
    "When?",
    "File",
    "Line",
    "Runtime error message",
    "Trace",
    "IP",
];

/// How timestamps are shown and what decorates the page.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    date_format: String,
    offset: FixedOffset,
    decoration: String,
}

impl ReportSettings {
    pub fn from_config(config: &ReportConfig) -> Self {
        ReportSettings {
            date_format: config.date_format.clone(),
            offset: FixedOffset::east_opt(config.utc_offset_seconds).unwrap_or_else(|| Utc.fix()),
            decoration: config.decoration.clone(),
        }
    }

    /// Formats a unix timestamp in the configured offset and format.
    pub fn format_time(&self, timestamp: i64) -> String {
        let datetime_utc = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();
        let datetime = datetime_utc.with_timezone(&self.offset);

        let mut formatted = String::new();
        if write!(formatted, "{}", datetime.format(&self.date_format)).is_err() {
            return datetime.to_rfc3339();
        }
        formatted
    }
}

/// One table row, with every value already turned into display text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub id: String,
    pub message: String,
    pub exception_message: String,
    pub when: String,
    pub file: String,
    pub line: String,
    pub runtime_error_message: String,
    pub trace: String,
    pub ip: String,
}

impl ReportRow {
    fn from_record(record: &ErrorRecord, settings: &ReportSettings) -> Self {
        ReportRow {
            id: record.id.to_string(),
            message: record.message.clone(),
            exception_message: record.exception_message.clone(),
            when: settings.format_time(record.log_time),
            file: record.file.clone(),
            line: record.line.to_string(),
            runtime_error_message: record.runtime_error_message.clone(),
            trace: record.trace.clone(),
            ip: record.remote_address.clone(),
        }
    }

    fn cells(&self) -> [&str; 9] {
        [
            &self.id,
            &self.message,
            &self.exception_message,
            &self.when,
            &self.file,
            &self.line,
            &self.runtime_error_message,
            &self.trace,
            &self.ip,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportBody {
    /// The log could not be read. `logging_failed` is set when recording that
    /// failure did not work either.
    Failed {
        message: String,
        logging_failed: bool,
    },
    Empty,
    Rows(Vec<ReportRow>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub generated_at: String,
    pub decoration: String,
    pub body: ReportBody,
}

impl Report {
    pub fn rows(&self) -> &[ReportRow] {
        match &self.body {
            ReportBody::Rows(rows) => rows,
            _ => &[],
        }
    }

    /// Renders the report as a complete HTML page. Every value taken from the log
    /// is escaped.
    pub fn to_html(&self) -> String {
        let mut html = String::with_capacity(4096);

        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str("<title>Error Logs</title>\n");
        html.push_str(REPORT_STYLE);
        html.push_str("</head>\n<body>\n");
        html.push_str(&self.decoration);
        html.push_str(&format!(
            "<div class=\"row text-center\">\n<h3>Error logs as of <b>{}</b></h3>\n</div>\n",
            escape_html(&self.generated_at)
        ));

        match &self.body {
            ReportBody::Failed {
                message,
                logging_failed,
            } => {
                html.push_str(&format!(
                    "<div class=\"row text-center\"><p>{}</p><p>Message \"{}\"</p></div>\n",
                    RETRIEVAL_FAILED_NOTICE,
                    escape_html(message)
                ));
                if *logging_failed {
                    html.push_str(&format!(
                        "<div class=\"row text-center\"><p>{}</p></div>\n",
                        LOGGING_FAILED_NOTICE
                    ));
                }
            }
            ReportBody::Empty => {
                html.push_str(&format!("<p>{}</p>\n", NO_ERRORS_NOTICE));
            }
            ReportBody::Rows(rows) => {
                html.push_str("<div class=\"error-logs-div-wrapper\">\n<div class=\"error-logs-div\">\n");
                html.push_str("<table class=\"text-center\">\n<thead>\n<tr>");
                for column in COLUMNS {
                    html.push_str(&format!("<th>{}</th>", column));
                }
                html.push_str("</tr>\n</thead>\n<tbody>\n");

                for row in rows {
                    html.push_str("<tr>");
                    for cell in row.cells() {
                        html.push_str(&format!("<td>{}</td>", escape_html(cell)));
                    }
                    html.push_str("</tr>\n");
                }

                html.push_str("</tbody>\n</table>\n</div>\n</div>\n");
            }
        }

        html.push_str("</body>\n</html>\n");
        html
    }

    /// Renders the report for a terminal.
    pub fn to_text(&self) -> String {
        let mut text = format!("Error logs as of {}\n", self.generated_at);

        match &self.body {
            ReportBody::Failed {
                message,
                logging_failed,
            } => {
                text.push_str(&format!("{}\nMessage \"{}\"\n", RETRIEVAL_FAILED_NOTICE, message));
                if *logging_failed {
                    text.push_str(LOGGING_FAILED_NOTICE);
                    text.push('\n');
                }
            }
            ReportBody::Empty => {
                text.push_str(NO_ERRORS_NOTICE);
                text.push('\n');
            }
            ReportBody::Rows(rows) => {
                let mut builder = Builder::default();
                builder.push_record(COLUMNS.iter().map(|column| column.to_string()));
                for row in rows {
                    builder.push_record(row.cells().iter().map(|cell| cell.to_string()));
                }

                let mut table = builder.build();
                table.with(Style::modern());
                text.push_str(&table.to_string());
                text.push('\n');
            }
        }

        text
    }
}

/// Reads the whole error log and turns it into a [`Report`].
pub struct ReportRenderer<'a> {
    source: &'a ErrorStore,
    capture: &'a Capture,
    settings: ReportSettings,
}

impl<'a> ReportRenderer<'a> {
    /// `source` is read for the report; read failures are recorded through `capture`.
    pub fn new(source: &'a ErrorStore, capture: &'a Capture, settings: ReportSettings) -> Self {
        ReportRenderer {
            source,
            capture,
            settings,
        }
    }

    pub fn render(&self) -> Report {
        self.render_at(Utc::now().timestamp())
    }

    pub fn render_at(&self, now: i64) -> Report {
        let _tmr = timer!(Level::Debug; "ReportRenderer::render");

        let report = |body: ReportBody| Report {
            generated_at: self.settings.format_time(now),
            decoration: self.settings.decoration.clone(),
            body,
        };

        let records = match self.source.read_all() {
            Ok(records) => records,
            Err(err) => {
                debug!("Error logs could not be retrieved ({} failure): {}", err.kind(), err);
                let logging_failed = !self.capture.report_error(&err, "");

                return report(ReportBody::Failed {
                    message: err.to_string(),
                    logging_failed,
                });
            }
        };

        if records.is_empty() {
            return report(ReportBody::Empty);
        }

        let rows = records
            .iter()
            .map(|record| ReportRow::from_record(record, &self.settings))
            .collect();

        report(ReportBody::Rows(rows))
    }
}

/// Escapes text for use in HTML element content and attribute values.
pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

const REPORT_STYLE: &str = r#"<style>
  body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; margin: 1rem; }
  .text-center { text-align: center; }
  .error-logs-div-wrapper { overflow-x: auto; }
  table { border-collapse: collapse; width: 100%; }
  th, td { border: 1px solid #ccc; padding: 0.3rem 0.5rem; vertical-align: top; }
  td { white-space: pre-wrap; word-break: break-word; font-size: 0.85rem; }
  th { background: #f0f0f0; }
</style>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;
    use crate::record::NewErrorRecord;
    use crate::store::tests::{temp_store, unreachable_store};
    use pretty_assertions::assert_eq;

    fn settings(date_format: &str, utc_offset_seconds: i32) -> ReportSettings {
        ReportSettings::from_config(&ReportConfig {
            date_format: date_format.to_string(),
            utc_offset_seconds,
            decoration: String::new(),
        })
    }

    #[test]
    fn test_format_time_applies_offset_and_format() {
        // 2024-03-01 21:30:00 UTC
        let ts = 1_709_328_600;

        assert_eq!(settings("%Y-%m-%d %H:%M", 0).format_time(ts), "2024-03-01 21:30");
        assert_eq!(settings("%Y-%m-%d %H:%M", 3 * 3600).format_time(ts), "2024-03-02 00:30");
        assert_eq!(settings("%d.%m.%Y", -5 * 3600).format_time(ts), "01.03.2024");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x & y's")</script>"#),
            "&lt;script&gt;alert(&quot;x &amp; y&#39;s&quot;)&lt;/script&gt;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_render_empty_store() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        let report = ReportRenderer::new(&store, &capture, settings("%Y", 0)).render();

        assert_eq!(report.body, ReportBody::Empty);
        assert!(report.rows().is_empty());

        let html = report.to_html();
        assert!(html.contains(NO_ERRORS_NOTICE));
        assert!(!html.contains("<tr>"));
        assert!(report.to_text().contains(NO_ERRORS_NOTICE));
    }

    #[test]
    fn test_render_rows_newest_first() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());

        for i in 1..=3 {
            assert!(store.append(&NewErrorRecord::new(format!("error {}", i), "w.rs", i, "N/A", "")));
        }

        let report = ReportRenderer::new(&store, &capture, settings("%Y-%m-%d", 0)).render();
        let rows = report.rows();

        assert_eq!(rows.len(), 3);
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
        assert_eq!(rows[0].message, "error 3");

        let html = report.to_html();
        assert_eq!(html.matches("<tr>").count(), 4); // header + 3 rows
        assert!(html.find("error 3").unwrap() < html.find("error 1").unwrap());

        let text = report.to_text();
        assert!(text.contains("Error ID"));
        assert!(text.contains("error 2"));
    }

    #[test]
    fn test_render_shows_log_time_in_configured_zone() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());
        assert!(store.append(&NewErrorRecord::new("m", "f.rs", 1, "N/A", "")));

        let log_time = store.read_all().unwrap()[0].log_time;
        let settings = settings("%Y-%m-%d %H:%M:%S", 10800);
        let expected = settings.format_time(log_time);

        let report = ReportRenderer::new(&store, &capture, settings).render();
        assert_eq!(report.rows()[0].when, expected);
    }

    #[test]
    fn test_render_escapes_fields() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());
        assert!(store.append(&NewErrorRecord::new("<img src=x onerror=alert(1)>", "f.rs", 1, "N/A", "")));

        let html = ReportRenderer::new(&store, &capture, settings("%Y", 0))
            .render()
            .to_html();

        assert!(!html.contains("<img"));
        assert!(html.contains("&lt;img src=x onerror=alert(1)&gt;"));
    }

    #[test]
    fn test_render_read_failure_is_logged() {
        let (_dir, sink) = temp_store();
        let capture = Capture::new(sink.clone());
        let source = unreachable_store();

        let report = ReportRenderer::new(&source, &capture, settings("%Y", 0)).render();

        match &report.body {
            ReportBody::Failed {
                message,
                logging_failed,
            } => {
                assert!(message.starts_with("Database connection failed"));
                assert!(!logging_failed);
            }
            other => panic!("unexpected body: {:?}", other),
        }

        let html = report.to_html();
        assert!(html.contains(RETRIEVAL_FAILED_NOTICE));
        assert!(!html.contains(LOGGING_FAILED_NOTICE));
        assert!(!html.contains("<table"));

        let logged = sink.read_all().unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].exception_message.starts_with("Database connection failed"));
        assert!(logged[0].file.ends_with("report.rs"));
    }

    #[test]
    fn test_render_double_failure() {
        let source = unreachable_store();
        let capture = Capture::new(unreachable_store());

        let err = source.read_all().unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Connection);

        let report = ReportRenderer::new(&source, &capture, settings("%Y", 0)).render();

        assert!(matches!(
            report.body,
            ReportBody::Failed {
                logging_failed: true,
                ..
            }
        ));

        let html = report.to_html();
        assert!(html.contains(RETRIEVAL_FAILED_NOTICE));
        assert!(html.contains(LOGGING_FAILED_NOTICE));
        assert!(report.to_text().contains(LOGGING_FAILED_NOTICE));
    }

    #[test]
    fn test_decoration_and_header() {
        let (_dir, store) = temp_store();
        let capture = Capture::new(store.clone());
        let settings = ReportSettings::from_config(&ReportConfig {
            decoration: "<nav>home</nav>".to_string(),
            ..ReportConfig::default()
        });

        let report = ReportRenderer::new(&store, &capture, settings).render_at(0);
        let html = report.to_html();

        assert!(html.contains("<nav>home</nav>"));
        assert!(html.contains("Error logs as of <b>01.01.1970 00:00:00</b>"));
    }
}
