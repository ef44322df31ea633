use {
    anyhow::{Context, Result},
    clap::Subcommand,
    secrecy::ExposeSecret,
};

use {
    botlink_bots::BotRepository,
    botlink_config::StorageConfig,
};

#[derive(Subcommand)]
pub enum BotAction {
    /// Register a new bot identity and print its secret.
    Register {
        name: String,
        /// Use this secret instead of generating one.
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List registered bots.
    List {
        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove a bot identity.
    Remove { name: String },
    /// Update the description of a bot.
    Describe {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
}

async fn open_repository(storage: &StorageConfig) -> Result<BotRepository> {
    if matches!(storage, StorageConfig::Memory) {
        anyhow::bail!(
            "storage backend is 'memory'; manage bots through the admin API of the running gateway"
        );
    }
    let store = botlink_store::open_store(storage)
        .await
        .context("failed to open record store")?;
    Ok(BotRepository::new(store))
}

pub async fn handle_bots(action: BotAction, storage: &StorageConfig) -> Result<()> {
    let repo = open_repository(storage).await?;
    match action {
        BotAction::Register {
            name,
            secret,
            description,
        } => register(&repo, &name, secret, description).await,
        BotAction::List { json } => list(&repo, json).await,
        BotAction::Remove { name } => {
            repo.remove(&name).await?;
            println!("Removed {name}");
            Ok(())
        },
        BotAction::Describe { name, description } => {
            repo.describe(&name, description).await?;
            println!("Updated {name}");
            Ok(())
        },
    }
}

async fn register(
    repo: &BotRepository,
    name: &str,
    secret: Option<String>,
    description: Option<String>,
) -> Result<()> {
    let generated = secret.is_none();
    let identity = repo.register(name, secret, description).await?;
    println!("Registered {}", identity.name);
    if generated {
        println!("Secret: {}", identity.secret.expose_secret());
        println!("Store it now; it cannot be shown again.");
    }
    Ok(())
}

async fn list(repo: &BotRepository, json: bool) -> Result<()> {
    let bots = repo.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&bots)?);
        return Ok(());
    }
    if bots.is_empty() {
        println!("No bots registered.");
        return Ok(());
    }
    let width = bots.iter().map(|b| b.name.len()).max().unwrap_or(0);
    for bot in bots {
        println!(
            "{:<width$}  {}",
            bot.name,
            bot.description.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_remove_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::File {
            path: Some(dir.path().join("bots.json")),
        };

        handle_bots(
            BotAction::Register {
                name: "echo-bot".into(),
                secret: Some("s3cr3t".into()),
                description: None,
            },
            &storage,
        )
        .await
        .unwrap();

        let repo = open_repository(&storage).await.unwrap();
        assert!(repo.verify("echo-bot", "s3cr3t").await);

        handle_bots(
            BotAction::Remove {
                name: "echo-bot".into(),
            },
            &storage,
        )
        .await
        .unwrap();
        let repo = open_repository(&storage).await.unwrap();
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_backend_is_refused() {
        assert!(open_repository(&StorageConfig::Memory).await.is_err());
    }
}
