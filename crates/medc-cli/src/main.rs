use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use medc_core::{EncryptionConfig, MessageEncryption};
use medc_crypto::{CryptoProvider, DalekProvider};
use tracing::{info, warn};

mod setup;

#[derive(Parser)]
#[command(name = "medc")]
#[command(about = "MediConnect message encryption - key management and message tooling")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local user id (overrides the configuration)
    #[arg(short, long)]
    user: Option<String>,

    /// Log level (overrides the configuration)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the local public keys, publishing them if a directory is configured
    PublicKey,
    /// Encrypt a message for a conversation
    Encrypt {
        #[arg(long)]
        conversation: String,
        /// Counterpart user id; enables the agreed key
        #[arg(long)]
        with: Option<String>,
        message: String,
    },
    /// Decrypt a payload received in a conversation
    Decrypt {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        from: String,
        payload: String,
    },
    /// Replace the identity agreement key
    Rotate,
    /// Show identity and conversation key status
    Status,
    /// Delete conversation keys
    Clear {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        conversation: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

fn load_config(args: &Args) -> anyhow::Result<EncryptionConfig> {
    let mut config = match &args.config {
        Some(path) => EncryptionConfig::load_from_file(path)?,
        None => {
            let mut config = EncryptionConfig::default();
            config.apply_overrides(|name| std::env::var(name).ok());
            config
        }
    };
    if let Some(user) = &args.user {
        config.user_id = user.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if args.json_logs {
        config.log_json = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    setup::init_logging(&config.log_level, config.log_json);
    info!(user = %config.user_id, "Starting medc");

    let provider: Arc<dyn CryptoProvider> = Arc::new(DalekProvider::new());
    let store = setup::open_store(&config, provider.clone(), |name| std::env::var(name).ok())?;
    let directory = setup::open_directory(&config)?;
    let encryption = MessageEncryption::new(config, store, directory, provider)?;

    match args.command {
        Command::PublicKey => {
            let keys = encryption.public_keys().await?;
            if let Err(e) = encryption.publish_public_keys().await {
                warn!(error = %e, "Publishing local keys failed");
            }
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Command::Encrypt {
            conversation,
            with,
            message,
        } => {
            if let Some(counterpart) = with {
                let status = encryption
                    .open_conversation(&conversation, &counterpart)
                    .await?;
                info!(
                    conversation = %status.id,
                    method = status.method.as_str(),
                    version = status.version,
                    "Conversation key ready"
                );
            }
            println!("{}", encryption.encrypt(&conversation, &message).await?);
        }
        Command::Decrypt {
            conversation,
            from,
            payload,
        } => {
            let out = encryption
                .decrypt_detailed(&conversation, &payload, &from)
                .await?;
            let report = serde_json::json!({
                "text": out.text,
                "outcome": out.outcome,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Rotate => {
            let bundle = encryption.rotate_identity_key().await?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
        Command::Status => {
            let status = encryption.encryption_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Clear { conversation, all } => {
            if all {
                let count = encryption.clear_all_conversation_keys().await?;
                println!("cleared {} conversation keyrings", count);
            } else if let Some(conversation) = conversation {
                encryption.clear_conversation_key(&conversation).await?;
                println!("cleared {}", conversation);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_encrypt() {
        let args = Args::try_parse_from([
            "medc",
            "--user",
            "patient-7",
            "encrypt",
            "--conversation",
            "conv-42",
            "--with",
            "dr-lee",
            "Hello, Doctor",
        ])
        .unwrap();
        match args.command {
            Command::Encrypt {
                conversation,
                with,
                message,
            } => {
                assert_eq!(conversation, "conv-42");
                assert_eq!(with.as_deref(), Some("dr-lee"));
                assert_eq!(message, "Hello, Doctor");
            }
            _ => panic!("expected encrypt"),
        }
    }

    #[test]
    fn test_clear_needs_a_target() {
        assert!(Args::try_parse_from(["medc", "clear"]).is_err());
        assert!(Args::try_parse_from(["medc", "clear", "--all", "--conversation", "c"]).is_err());
        assert!(Args::try_parse_from(["medc", "clear", "--all"]).is_ok());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "medc", "--user", "dr-lee", "--log-level", "debug", "--json-logs", "status",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.user_id, "dr-lee");
        assert_eq!(config.log_level, "debug");
        assert!(config.log_json);
    }
}
