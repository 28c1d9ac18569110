use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::{info, warn};

use crate::capture::{self, Capture};
use crate::config::{Config, CONFIG};
use crate::error::FaultLogError;
use crate::installer::{InstallOptions, Installer};
use crate::record::TRACE_NOT_AVAILABLE;
use crate::report::{ReportRenderer, ReportSettings};
use crate::server::{AppState, WebServer};
use crate::store::ErrorStore;

#[derive(Parser)]
#[command(
    name = "faultlog",
    version,
    about = "faultlog: captures errors into SQLite and reports them"
)]
pub struct Cli {
    /// Database file (overrides the configured path)
    #[arg(long = "db", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the error report over HTTP (default if no command specified)
    Serve,

    /// Create the error log table if it doesn't exist
    Init,

    /// Print the error log, newest first
    Report,

    /// Record an error from the command line
    Log {
        /// Description of the error
        #[arg(long = "message", short = 'm', default_value = "")]
        message: String,

        /// Source file the error relates to
        #[arg(long = "file", short = 'f', default_value = "")]
        file: String,

        /// Line number in the source file
        #[arg(long = "line", short = 'l', default_value_t = 0)]
        line: i64,

        /// Stack trace, if one is available
        #[arg(long = "trace", default_value = TRACE_NOT_AVAILABLE)]
        trace: String,

        /// Message of the exception that caused the error
        #[arg(long = "exception", short = 'e', default_value = "")]
        exception: String,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), FaultLogError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "faultlog")
            .ok_or_else(|| FaultLogError::Error("Could not determine the data directory".into()))?;
        let data_dir = project_dirs.data_local_dir().to_owned();
        fs::create_dir_all(&data_dir)?;

        let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));

        let mut database = config.database.clone();
        if let Some(db) = &args.db {
            database.path = db.to_string_lossy().into_owned();
        }
        let store = ErrorStore::from_config(&database, &data_dir);

        let guard = Installer::new(
            store.clone(),
            InstallOptions {
                display_errors: config.capture.display_errors,
                log_spec: Some(config.logging.log_spec()),
                log_dir: Some(data_dir.join("logs")),
            },
        )
        .install()?;

        let command = args.command.unwrap_or(Command::Serve);
        if database.create_table && !matches!(command, Command::Init) {
            if let Err(e) = store.ensure_table() {
                warn!("Could not create the error log table: {}", e);
            }
        }

        let result = Self::run_command(command, &store, guard.capture(), config);

        if let Err(err) = &result {
            guard.capture().raise_fatal(&err.to_string());
        }
        guard.shutdown();

        result
    }

    fn run_command(
        command: Command,
        store: &ErrorStore,
        capture: &'static Capture,
        config: &Config,
    ) -> Result<(), FaultLogError> {
        match command {
            Command::Serve => Self::start_server(store, capture, config),
            Command::Init => {
                store.ensure_table()?;
                println!(
                    "Error log table '{}' is ready in {}",
                    store.table(),
                    store.db_path().display()
                );
                Ok(())
            }
            Command::Report => {
                let settings = ReportSettings::from_config(&config.report);
                let report = ReportRenderer::new(store, capture, settings).render();
                print!("{}", report.to_text());
                info!("Printed error report with {} rows", report.rows().len());
                Ok(())
            }
            Command::Log {
                message,
                file,
                line,
                trace,
                exception,
            } => {
                if capture::report(&message, &file, line, &trace, &exception) {
                    println!("Error recorded");
                    Ok(())
                } else {
                    Err(FaultLogError::Error(format!(
                        "The error could not be recorded in {}",
                        store.db_path().display()
                    )))
                }
            }
        }
    }

    fn start_server(
        store: &ErrorStore,
        capture: &'static Capture,
        config: &Config,
    ) -> Result<(), FaultLogError> {
        let host = config.server.host.clone();
        let port = config.server.port;

        info!("Starting server on {}:{}", host, port);

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| FaultLogError::Error(format!("Failed to create runtime: {}", e)))?;

        let state = AppState::new(
            store.clone(),
            capture,
            ReportSettings::from_config(&config.report),
        );

        rt.block_on(async {
            let web_server = WebServer::new(host, port);
            web_server.start(state).await
        })
    }
}
