use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rdw_clients::{DiscordClient, HttpConfig, PageFetcher, SheetsClient, VideoCatalogClient};
use rdw_sync::{
    build_roster_projects, build_website_projects, check_host_responses, check_projects,
    check_releases, format_deadline_listing, start_scheduler, BotConfig, JobContext,
};
use tracing_subscriber::EnvFilter;

/// Printed in place of an empty reconciliation report.
const ALL_CLEAR: &str = "All good!";

#[derive(Debug, Parser)]
#[command(name = "rdw")]
#[command(about = "Watches the project roster and release log for drift")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduled checks until interrupted.
    Bot,
    /// Print the roster channel collection.
    GetRoster,
    /// Print the website listing collection.
    GetWebsite,
    /// Reconcile the roster against the website listing.
    CheckProjects,
    /// Reconcile the releases page against the hosted playlist.
    CheckReleases,
    /// Announce newly submitted host form responses.
    CheckResponses,
}

fn chat_client() -> Result<DiscordClient> {
    let token = std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?;
    DiscordClient::new(token)
}

fn page_fetcher(config: &BotConfig) -> Result<PageFetcher> {
    PageFetcher::new(HttpConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpConfig::default()
    })
}

fn video_client() -> Result<VideoCatalogClient> {
    let key = std::env::var("GOOGLE_API_KEY").context("GOOGLE_API_KEY is not set")?;
    VideoCatalogClient::new(key)
}

fn sheets_client() -> Result<SheetsClient> {
    let token = std::env::var("SHEETS_ACCESS_TOKEN").context("SHEETS_ACCESS_TOKEN is not set")?;
    SheetsClient::new(token)
}

fn print_report(report: String) {
    if report.is_empty() {
        println!("{ALL_CLEAR}");
    } else {
        print!("{report}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = BotConfig::from_env();

    match cli.command {
        Commands::Bot => {
            let ctx = JobContext {
                chat: Arc::new(chat_client()?),
                fetcher: Arc::new(page_fetcher(&config)?),
                videos: Arc::new(video_client()?),
                sheets: sheets_client().ok().map(Arc::new),
                config: Arc::new(config),
            };
            let _scheduler = start_scheduler(ctx).await?;
            println!("watcher is running, press ctrl-c to exit");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::GetRoster => {
            let chat = chat_client()?;
            let projects = build_roster_projects(&chat, &config).await?;
            print!("{}", format_deadline_listing(&projects));
        }
        Commands::GetWebsite => {
            let fetcher = page_fetcher(&config)?;
            let projects = build_website_projects(&fetcher, &config, Utc::now()).await?;
            print!("{}", format_deadline_listing(&projects));
        }
        Commands::CheckProjects => {
            let chat = chat_client()?;
            let fetcher = page_fetcher(&config)?;
            let report = check_projects(&chat, &fetcher, &config, Utc::now()).await?;
            print_report(report);
        }
        Commands::CheckReleases => {
            let fetcher = page_fetcher(&config)?;
            let videos = video_client()?;
            let report = check_releases(&fetcher, &videos, &config).await?;
            print_report(report);
        }
        Commands::CheckResponses => {
            let sheets = sheets_client()?;
            let responses = check_host_responses(&sheets, &config).await?;
            if responses.is_empty() {
                println!("no new host responses");
            } else {
                for response in responses {
                    println!("{} (#{})", response.announcement, response.slug);
                }
            }
        }
    }
    Ok(())
}
