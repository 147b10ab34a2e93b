//! s3cs -- command-line front end for the storage core.
//!
//! Reads the same YAML file a host application would, then runs one
//! operation against the configured endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use s3cs::config::{load_config, Config, Settings, SettingsFile, SettingsSource};
use s3cs::logging::init_tracing;
use s3cs::{DownloadGate, ObjectStoreClient};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "s3cs",
    version,
    about = "S3-compatible storage for gated digital downloads"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "s3cs.yaml")]
    config: PathBuf,

    /// Print Prometheus metrics after the command finishes.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the resolved connection settings.
    Status,
    /// List buckets visible to the credentials.
    Buckets,
    /// List folders and files under a prefix.
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Validate and upload a local file.
    Upload {
        file: PathBuf,
        /// Destination folder inside the bucket.
        #[arg(long, default_value = "")]
        folder: String,
        /// Stored file name (defaults to the local name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Print a presigned download URL for an object key.
    Presign {
        key: String,
        /// Link lifetime in minutes (1-60).
        #[arg(long)]
        expires: Option<i64>,
    },
    /// Resolve a stored file reference the way the storefront would.
    Resolve { reference: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing file is fine: settings may come entirely from S3CS_* variables.
    let from_file = cli.config.exists();
    let (config, source): (Config, Arc<dyn SettingsSource>) = if from_file {
        (
            load_config(&cli.config)?,
            Arc::new(SettingsFile::new(&cli.config)),
        )
    } else {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        (Config::default(), Arc::new(settings))
    };

    init_tracing(&config.logging);
    if from_file {
        info!("Loaded configuration from {}", cli.config.display());
    } else {
        info!(
            "No configuration file at {}; using S3CS_* environment variables",
            cli.config.display()
        );
    }

    if cli.metrics {
        s3cs::metrics::init_metrics()?;
    }

    let client = ObjectStoreClient::from_config(&config, source.clone())?;
    let gate = DownloadGate::from_config(&config, source);

    match cli.command {
        Command::Status => {
            let conn = client.connection();
            println!("endpoint:             {}", display_or_unset(&conn.endpoint));
            println!("bucket:               {}", display_or_unset(&conn.bucket));
            println!("region:               {}", conn.region);
            println!("link expiry (min):    {}", conn.link_expiry_minutes);
            println!("url prefix:           {}", gate.url_prefix());
            println!("configured:           {}", conn.is_configured());
            println!("configured (listing): {}", conn.is_configured_for_listing());
        }
        Command::Buckets => {
            for name in client.list_buckets().await {
                println!("{name}");
            }
        }
        Command::Ls { prefix } => {
            for entry in client.list_objects(&prefix).await {
                if entry.is_folder {
                    println!("{:>12}  {}/", "DIR", entry.name);
                } else {
                    println!("{:>12}  {}", entry.size_bytes, entry.name);
                }
            }
        }
        Command::Upload { file, folder, name } => {
            let result = client.upload_file(&file, &folder, name.as_deref()).await?;
            println!("uploaded:  {}", result.stored_path);
            println!("filename:  {}", result.display_filename);
            println!("reference: {}", gate.reference_for(&result.stored_path));
        }
        Command::Presign { key, expires } => {
            let generator = s3cs::PresignedUrlGenerator::new(client.connection());
            println!("{}", generator.generate(&key, expires)?);
        }
        Command::Resolve { reference } => {
            println!("{}", gate.resolve(&reference));
        }
    }

    if let Some(text) = s3cs::metrics::render() {
        print!("{text}");
    }

    Ok(())
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(not set)"
    } else {
        value
    }
}
