//! `gist` command line client.
//!
//! ```bash
//! gist --passphrase correcthorse register A1
//! GIST_PASSPHRASE=correcthorse gist encrypt "hello"
//! gist export-key > a1-backup.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use tracing::info;

use gist_core::config::AppConfig;
use gist_core::crypto::cipher::EncryptedEnvelope;
use gist_core::identity::{CachedDirectory, Directory, FileDirectory, IdentityBackup, KeyCustody, Session};
use gist_core::logging::init_logging;
use gist_core::secure_message::DECRYPTION_PLACEHOLDER;
use gist_core::security::FileDeviceStorage;

/// Gist encrypted chat client
#[derive(Parser, Debug)]
#[command(name = "gist")]
#[command(about = "Passphrase-encrypted chat: identities, keys and envelopes")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "GIST_CONFIG")]
    config: Option<PathBuf>,

    /// Shared passphrase
    #[arg(short, long, env = "GIST_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an identity and keep its keys on this device
    Register { handle: String },
    /// Check the passphrase against this device's keys
    Login { handle: String },
    /// Look up a published identity (case-insensitive)
    Search { handle: String },
    /// Print a backup of this device's private keys
    ExportKey { handle: Option<String> },
    /// Install a backup produced by `export-key`
    ImportKey { file: PathBuf },
    /// Remove all key material from this device
    Forget,
    /// Encrypt text into a JSON envelope
    Encrypt { text: String },
    /// Decrypt a JSON envelope
    Decrypt { envelope: String },
    /// Print the effective configuration
    Config,
}

type Custody = KeyCustody<CachedDirectory<FileDirectory>, FileDeviceStorage>;

fn open_custody(cfg: &AppConfig) -> Result<Custody> {
    let directory = CachedDirectory::new(FileDirectory::new(cfg.directory_path()), cfg.directory_cache_ttl());
    let storage = FileDeviceStorage::open(cfg.device_store_path())
        .map_err(|e| eyre!("opening device store in {}: {e:#}", cfg.data_dir.display()))?;
    Ok(KeyCustody::new(directory, storage, cfg.custody_options()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let cfg = AppConfig::load(args.config.as_deref())?;
    let _guard = init_logging(&cfg.log_filter, args.log_dir.as_deref());

    let passphrase = || {
        args.passphrase
            .as_deref()
            .ok_or_else(|| eyre!("passphrase required (--passphrase or GIST_PASSPHRASE)"))
    };

    match &args.command {
        Command::Register { handle } => {
            let custody = open_custody(&cfg)?;
            let mut session = Session::new();
            custody.register(&mut session, handle, passphrase()?).await?;
            println!("registered {handle}");
        }
        Command::Login { handle } => {
            let custody = open_custody(&cfg)?;
            let mut session = Session::new();
            custody.login(&mut session, handle, passphrase()?).await?;
            println!("unlocked {handle}");
        }
        Command::Search { handle } => {
            let custody = open_custody(&cfg)?;
            match custody.directory().search(handle).await? {
                Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                None => println!("no identity {}", handle.trim().to_ascii_uppercase()),
            }
        }
        Command::ExportKey { handle } => {
            let custody = open_custody(&cfg)?;
            let handle = match handle {
                Some(h) => h.clone(),
                None => custody
                    .device_handle()?
                    .ok_or_else(|| eyre!("no identity on this device"))?
                    .to_string(),
            };
            let mut session = Session::new();
            custody.login(&mut session, &handle, passphrase()?).await?;
            let backup = custody.export_identity(&session)?;
            println!("{}", serde_json::to_string_pretty(&backup)?);
        }
        Command::ImportKey { file } => {
            let custody = open_custody(&cfg)?;
            let raw = std::fs::read_to_string(file).wrap_err_with(|| format!("reading {}", file.display()))?;
            let backup: IdentityBackup = serde_json::from_str(&raw).wrap_err("malformed backup file")?;
            custody.import_identity(&Session::new(), &backup, passphrase()?).await?;
            println!("imported {}", backup.user_id);
        }
        Command::Forget => {
            let custody = open_custody(&cfg)?;
            custody.forget_device_identity(&Session::new())?;
            println!("device key material removed");
        }
        Command::Encrypt { text } => {
            let custody = open_custody(&cfg)?;
            let envelope = custody.cipher().encrypt(text, passphrase()?).await?;
            println!("{}", envelope.to_json()?);
        }
        Command::Decrypt { envelope } => {
            let custody = open_custody(&cfg)?;
            let envelope = EncryptedEnvelope::from_json(envelope)?;
            match custody.cipher().decrypt(&envelope, passphrase()?).await {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{DECRYPTION_PLACEHOLDER}"),
            }
        }
        Command::Config => {
            print!("{}", cfg.to_toml()?);
        }
    }

    info!("done");
    Ok(())
}
