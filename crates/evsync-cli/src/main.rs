use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

#[derive(Debug, Parser)]
#[command(name = "evsync-cli")]
#[command(about = "Sync event listings from the Meetup GraphQL API into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search, deduplicate and upsert into the configured table.
    Sync,
    /// Search and print the events as JSON without writing anything.
    Fetch,
    /// Confirm MEETUP_API_TOKEN is accepted.
    CheckToken,
    /// Print the fields of a GraphQL type.
    InspectSchema {
        #[arg(long = "type", value_name = "TYPE", default_value = "EventSearchFilter")]
        type_name: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    debug!(?cli, "parsed arguments");

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = evsync_sync::run_sync_once_from_env().await?;
            if summary.upsert.batches_failed > 0 || summary.searches_aborted > 0 {
                warn!(
                    batches_failed = summary.upsert.batches_failed,
                    searches_aborted = summary.searches_aborted,
                    "sync finished with errors"
                );
            }
            println!(
                "sync complete: run_id={} sink={} searches={} capped={} fetched={} unique={} duplicates={} upserted={} failed={}",
                summary.run_id,
                summary.sink,
                summary.searches,
                summary.searches_capped,
                summary.fetched,
                summary.unique,
                summary.duplicates_removed,
                summary.upsert.rows_upserted,
                summary.upsert.rows_failed
            );
        }
        Commands::Fetch => {
            let report = evsync_sync::fetch_events_from_env().await?;
            let json = serde_json::to_string_pretty(&report.dedup.rows).context("encoding events")?;
            println!("{json}");
            eprintln!(
                "fetched {} unique events ({} duplicates removed) from {} searches",
                report.dedup.unique, report.dedup.duplicates_removed, report.searches
            );
        }
        Commands::CheckToken => {
            let identity = evsync_sync::check_token_from_env().await?;
            println!("token ok: {}", serde_json::to_string_pretty(&identity)?);
        }
        Commands::InspectSchema { type_name } => {
            let schema = evsync_sync::inspect_type_from_env(&type_name).await?;
            if schema.get("__type").map_or(true, |t| t.is_null()) {
                warn!(type_name = %type_name, "type not found");
            }
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }

    Ok(())
}
