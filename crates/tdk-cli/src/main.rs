use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tdk")]
#[command(about = "TranscriptDesk operational CLI", long_about = None)]
struct Cli {
    /// Database file (defaults to the config default path).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local ...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Equity universe commands
    Equity {
        #[command(subcommand)]
        cmd: EquityCmd,
    },

    /// Watchlist commands
    Watchlist {
        #[command(subcommand)]
        cmd: WatchlistCmd,
    },

    /// Group commands
    Group {
        #[command(subcommand)]
        cmd: GroupCmd,
    },

    /// Notification recipient commands
    Recipient {
        #[command(subcommand)]
        cmd: RecipientCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum EquityCmd {
    /// Insert or refresh one equity keyed by external identifier.
    Add {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        identifier: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        alt_code: Option<String>,
    },
}

#[derive(Subcommand)]
enum WatchlistCmd {
    Add {
        #[arg(long)]
        identifier: String,
    },
    Remove {
        #[arg(long)]
        identifier: String,
    },
}

#[derive(Subcommand)]
enum GroupCmd {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        deep_research_prompt: Option<String>,
        #[arg(long)]
        stock_summary_prompt: Option<String>,
    },
    AddMember {
        #[arg(long)]
        group_id: i64,
        #[arg(long)]
        identifier: String,
    },
}

#[derive(Subcommand)]
enum RecipientCmd {
    Add {
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = open_pool(cli.db).await?;
            match cmd {
                DbCmd::Status => {
                    let s = tdk_db::status(&pool).await?;
                    println!("db_ok={} has_schema={}", s.ok, s.has_schema);
                }
                DbCmd::Migrate => {
                    tdk_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = tdk_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Equity { cmd } => {
            let pool = open_pool(cli.db).await?;
            match cmd {
                EquityCmd::Add {
                    symbol,
                    identifier,
                    name,
                    alt_code,
                } => {
                    let equity_id = tdk_db::universe::upsert_equity(
                        &pool,
                        &symbol,
                        alt_code.as_deref(),
                        &identifier,
                        &name,
                    )
                    .await?;
                    println!("equity_id={equity_id}");
                }
            }
        }

        Commands::Watchlist { cmd } => {
            let pool = open_pool(cli.db).await?;
            match cmd {
                WatchlistCmd::Add { identifier } => {
                    let equity = require_equity(&pool, &identifier).await?;
                    let added =
                        tdk_db::universe::watchlist_add(&pool, equity.equity_id, Utc::now())
                            .await?;
                    println!("equity_id={} added={}", equity.equity_id, added);
                }
                WatchlistCmd::Remove { identifier } => {
                    let equity = require_equity(&pool, &identifier).await?;
                    let removed =
                        tdk_db::universe::watchlist_remove(&pool, equity.equity_id).await?;
                    println!("equity_id={} removed={}", equity.equity_id, removed);
                }
            }
        }

        Commands::Group { cmd } => {
            let pool = open_pool(cli.db).await?;
            match cmd {
                GroupCmd::Create {
                    name,
                    deep_research_prompt,
                    stock_summary_prompt,
                } => {
                    let group_id = tdk_db::universe::create_group(
                        &pool,
                        &name,
                        deep_research_prompt.as_deref(),
                        stock_summary_prompt.as_deref(),
                    )
                    .await?;
                    println!("group_id={group_id}");
                }
                GroupCmd::AddMember {
                    group_id,
                    identifier,
                } => {
                    let equity = require_equity(&pool, &identifier).await?;
                    let added = tdk_db::universe::group_add_member(
                        &pool,
                        group_id,
                        equity.equity_id,
                        Utc::now(),
                    )
                    .await?;
                    println!(
                        "group_id={} equity_id={} added={}",
                        group_id, equity.equity_id, added
                    );
                }
            }
        }

        Commands::Recipient { cmd } => {
            let pool = open_pool(cli.db).await?;
            match cmd {
                RecipientCmd::Add { email } => {
                    let added = tdk_db::universe::recipient_add(&pool, &email, Utc::now()).await?;
                    println!("email={email} added={added}");
                }
            }
        }
    }

    Ok(())
}

async fn open_pool(db: Option<PathBuf>) -> Result<sqlx::SqlitePool> {
    let path = db.unwrap_or_else(|| {
        PathBuf::from(tdk_config::PipelineConfig::default().database_path)
    });
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    tdk_db::connect(&path).await
}

async fn require_equity(
    pool: &sqlx::SqlitePool,
    identifier: &str,
) -> Result<tdk_db::EquityRow> {
    tdk_db::universe::fetch_equity_by_identifier(pool, identifier)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no equity with identifier '{identifier}'"))
}
