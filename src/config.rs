use std::fs;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub faultlog: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const FAULTLOG_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            faultlog: Self::FAULTLOG_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.faultlog.clone();
        self.faultlog = self.faultlog.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.faultlog.as_str()) {
            eprintln!(
                "Config error: faultlog log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::FAULTLOG_LEVEL
            );
            self.faultlog = Self::FAULTLOG_LEVEL.to_owned();
        }
    }

    /// Log specification handed to flexi_logger. Dependencies stay at warn so that
    /// their problems still reach the error log.
    pub fn log_spec(&self) -> String {
        format!("warn, faultlog={}", self.faultlog)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Database file. Empty means `faultlog.db` in the data directory.
    pub path: String,
    pub table_name: String,
    pub connect_timeout_ms: u64,
    pub create_table: bool,
}

impl DatabaseConfig {
    const DB_FILENAME: &str = "faultlog.db";
    const TABLE_NAME: &str = "error_logs";
    const CONNECT_TIMEOUT_MS: u64 = 5000;

    fn default() -> Self {
        DatabaseConfig {
            path: String::new(),
            table_name: Self::TABLE_NAME.to_owned(),
            connect_timeout_ms: Self::CONNECT_TIMEOUT_MS,
            create_table: true,
        }
    }

    fn ensure_valid(&mut self) {
        // The table name is spliced into SQL text, so only plain identifiers are accepted
        let valid_table = !self.table_name.is_empty()
            && !self.table_name.starts_with(|c: char| c.is_ascii_digit())
            && self
                .table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_table {
            eprintln!(
                "Config error: table name '{}' is invalid - using default of '{}'",
                self.table_name,
                Self::TABLE_NAME
            );
            self.table_name = Self::TABLE_NAME.to_owned();
        }

        if self.connect_timeout_ms == 0 {
            eprintln!(
                "Config error: connect timeout of 0 is invalid - using default of {}",
                Self::CONNECT_TIMEOUT_MS
            );
            self.connect_timeout_ms = Self::CONNECT_TIMEOUT_MS;
        }
    }

    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        if self.path.trim().is_empty() {
            data_dir.join(Self::DB_FILENAME)
        } else {
            PathBuf::from(self.path.trim())
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReportConfig {
    /// chrono strftime format used for every timestamp on the report
    pub date_format: String,
    /// Offset from UTC applied to timestamps before formatting
    pub utc_offset_seconds: i32,
    /// Trusted HTML inserted at the top of the report page (navigation, tracking)
    pub decoration: String,
}

impl ReportConfig {
    const DATE_FORMAT: &str = "%d.%m.%Y %H:%M:%S";
    const MAX_OFFSET_SECONDS: i32 = 86_399;

    pub fn default() -> Self {
        ReportConfig {
            date_format: Self::DATE_FORMAT.to_owned(),
            utc_offset_seconds: 0,
            decoration: String::new(),
        }
    }

    fn ensure_valid(&mut self) {
        let format_ok = !self.date_format.is_empty()
            && StrftimeItems::new(&self.date_format).all(|item| !matches!(item, Item::Error));
        if !format_ok {
            eprintln!(
                "Config error: date format '{}' is invalid - using default of '{}'",
                self.date_format,
                Self::DATE_FORMAT
            );
            self.date_format = Self::DATE_FORMAT.to_owned();
        }

        if self.utc_offset_seconds.abs() > Self::MAX_OFFSET_SECONDS {
            eprintln!(
                "Config error: UTC offset of {} seconds is out of range - using 0",
                self.utc_offset_seconds
            );
            self.utc_offset_seconds = 0;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Show captured failures on stderr as well as storing them
    pub display_errors: bool,
}

impl CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            display_errors: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub report: ReportConfig,
    pub server: ServerConfig,
    pub capture: CaptureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            report: ReportConfig::default(),
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's data directory,
    /// overridden by `FAULTLOG_` environment variables (`FAULTLOG_SERVER__PORT=9000`).
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let default_config = Config::default();

        if !config_path.exists() {
            Self::write_default(&config_path, &default_config);
        }

        Self::load_from(&config_path, default_config)
    }

    fn load_from(config_path: &Path, default_config: Config) -> Self {
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("FAULTLOG_").split("__"));

        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.report.ensure_valid();
    }
}
