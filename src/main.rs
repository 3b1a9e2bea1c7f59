use anyhow::Result;
use clap::{CommandFactory, Parser};
use gdrive_backup::auth;
use gdrive_backup::backup::BackupManager;
use gdrive_backup::cli::Cli;
use gdrive_backup::config::Config;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ERROR_EXIT_CODE: u8 = 2;

async fn run(config: &Config) -> Result<()> {
    let manager = BackupManager::new(config);

    let artifact = manager.create_backup()?;
    println!("Backup Archive: {}", artifact.path.display());

    let result = async {
        let drive = auth::authorize(config).await?;
        manager.upload_backup(&drive, &artifact).await
    }
    .await;

    match result {
        Ok(receipt) => {
            info!(
                "Uploaded {} into {} (file id {}, folder id {})",
                receipt.file_name, config.destination, receipt.file_id, receipt.folder_id
            );
            manager.finish(&artifact)
        }
        Err(e) => {
            error!("Upload failed, staged archive kept at {}", artifact.path.display());
            Err(e)
        }
    }
}

fn report_error(err: &anyhow::Error) -> ExitCode {
    eprintln!("{}", Cli::command().render_usage());
    eprintln!("Error!\n{:#}", err);
    ExitCode::from(ERROR_EXIT_CODE)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gdrive_backup=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => return report_error(&e),
    };

    println!("Google Drive backup utility.");
    println!(
        "Args:\n Source: {}\n Destination: {}\n Descriptor: {}\n",
        config.source.display(),
        config.destination,
        config.tag
    );

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(&e),
    }
}
