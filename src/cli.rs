use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gdrive-backup")]
#[command(about = "Archive a directory into a tar.gz and upload it to Google Drive")]
#[command(version)]
pub struct Cli {
    /// The source folder to backup [default: .]
    #[arg(short, long)]
    pub src: Option<PathBuf>,

    /// The Google Drive backup destination folder [default: /backup]
    #[arg(short, long)]
    pub dest: Option<String>,

    /// The descriptor tag which will be included in the filename
    #[arg(short, long)]
    pub tag: Option<String>,

    /// API key (accepted for compatibility, not used by the Drive flow)
    #[arg(short, long)]
    pub key: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// OAuth client secrets file [default: credentials.json]
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// OAuth token cache file [default: token.json]
    #[arg(long)]
    pub token: Option<PathBuf>,

    /// Directory the archive is staged in before upload [default: .]
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Keep the staged archive after a successful upload
    #[arg(long)]
    pub keep: bool,

    /// Delete the staged archive after upload, overriding the config file
    #[arg(long, conflicts_with = "keep")]
    pub no_keep: bool,
}
