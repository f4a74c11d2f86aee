use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use hotclose::{HotClose, HotCloseConfig, RowSelector, SessionKey, TableId};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hotclose-tool")]
#[command(about = "Inspect and maintain the hot close change history store")]
struct Cli {
    /// Store directory; falls back to HOTCLOSE_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the decoded rows stored for one document.
    Dump {
        #[arg(long)]
        session: String,
    },
    /// Delete the rows of one document, or of every document.
    Delete {
        #[arg(long, conflicts_with = "all")]
        session: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Drop all tables.
    Wipe {
        #[arg(long)]
        yes: bool,
    },
    /// Row counts and space usage.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = HotCloseConfig::from_env().context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config = config.data_dir(dir);
    }
    if config.data_dir.is_none() {
        bail!("no store directory: pass --data-dir or set HOTCLOSE_DATA_DIR");
    }

    let hot_close = HotClose::open(config).await;
    if !hot_close.is_available() {
        return Err(anyhow!("store could not be opened (see log for details)"));
    }

    match cli.command {
        Command::Dump { session } => {
            let rows = hot_close
                .dump_rows(&SessionKey::new(session.as_str()))
                .await
                .with_context(|| format!("failed to read rows for '{}'", session))?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Delete { session, all } => {
            let selector = match (session, all) {
                (Some(session), false) => RowSelector::Session(SessionKey::new(session)),
                (None, true) => RowSelector::All,
                _ => bail!("pass exactly one of --session or --all"),
            };
            hot_close.delete_rows(selector).await.context("delete failed")?;
            println!("Deleted.");
        }
        Command::Wipe { yes } => {
            if !yes {
                bail!("refusing to drop all tables without --yes");
            }
            hot_close.wipe_store().await.context("wipe failed")?;
            println!("All tables dropped.");
        }
        Command::Stats => print_stats(&hot_close).await?,
    }
    Ok(())
}

async fn print_stats(hot_close: &HotClose) -> Result<()> {
    let store = hot_close
        .store()
        .ok_or_else(|| anyhow!("store unavailable"))?;

    for table in TableId::ALL {
        if store.table_exists(table).await {
            let rows = store.row_count(table).await?;
            println!("{:<22} {:>8} rows", table.name(), rows);
        } else {
            println!("{:<22} {:>8}", table.name(), "(absent)");
        }
    }
    println!(
        "{} / {} bytes used",
        store.used_bytes().await,
        store.capacity_bytes()
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("HOTCLOSE_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("hotclose=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
