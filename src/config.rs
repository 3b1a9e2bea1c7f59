use crate::cli::Cli;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_SOURCE: &str = ".";
const DEFAULT_DESTINATION: &str = "/backup";
const DEFAULT_CREDENTIALS: &str = "credentials.json";
const DEFAULT_TOKEN: &str = "token.json";
const DEFAULT_STAGING_DIR: &str = ".";

/// Effective settings for one run. Built once in `main` and passed down.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub source: PathBuf,
    pub destination: String,
    pub tag: String,
    pub api_key: Option<String>,
    pub credentials_path: PathBuf,
    pub token_path: PathBuf,
    pub staging_dir: PathBuf,
    pub keep_staged: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: PathBuf::from(DEFAULT_SOURCE),
            destination: DEFAULT_DESTINATION.to_string(),
            tag: String::new(),
            api_key: None,
            credentials_path: PathBuf::from(DEFAULT_CREDENTIALS),
            token_path: PathBuf::from(DEFAULT_TOKEN),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            keep_staged: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    backup: Option<BackupSection>,
    drive: Option<DriveSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackupSection {
    source: Option<PathBuf>,
    destination: Option<String>,
    tag: Option<String>,
    staging_dir: Option<PathBuf>,
    keep_staged: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DriveSection {
    credentials_path: Option<PathBuf>,
    token_path: Option<PathBuf>,
    api_key: Option<String>,
}

impl Config {
    /// Flags win over the config file, which wins over defaults.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let file = match cli.config.as_deref() {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file))
    }

    fn merge(cli: &Cli, file: FileConfig) -> Self {
        let backup = file.backup.unwrap_or_default();
        let drive = file.drive.unwrap_or_default();
        let defaults = Config::default();

        Self {
            source: cli.src.clone().or(backup.source).unwrap_or(defaults.source),
            destination: cli
                .dest
                .clone()
                .or(backup.destination)
                .unwrap_or(defaults.destination),
            tag: cli.tag.clone().or(backup.tag).unwrap_or(defaults.tag),
            api_key: cli.key.clone().or(drive.api_key),
            credentials_path: cli
                .credentials
                .clone()
                .or(drive.credentials_path)
                .unwrap_or(defaults.credentials_path),
            token_path: cli
                .token
                .clone()
                .or(drive.token_path)
                .unwrap_or(defaults.token_path),
            staging_dir: cli
                .staging_dir
                .clone()
                .or(backup.staging_dir)
                .unwrap_or(defaults.staging_dir),
            keep_staged: match (cli.keep, cli.no_keep) {
                (true, _) => true,
                (_, true) => false,
                _ => backup.keep_staged.unwrap_or(defaults.keep_staged),
            },
        }
    }
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}
