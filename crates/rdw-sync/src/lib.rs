//! Check orchestration: environment config, collection builders, the
//! reconciliation runs, and the cron scheduler.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rdw_clients::{ChatClient, PageFetcher, SheetsClient, VideoCatalogClient};
use rdw_core::{
    reconcile_projects, reconcile_releases, FormatError, LookupError, Project,
};
use rdw_sources::{
    extract_listing_projects, extract_message_urls, extract_project_page_urls,
    extract_release_video_ids, parse_roster_message, RecordOutcome, PROJECT_PATH_PREFIX,
};
use serde_json::{json, Value as JsonValue};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "rdw-sync";

/// How many of the latest roster messages are scanned per run.
pub const ROSTER_SCAN_LIMIT: u8 = 20;

/// Path of the releases page under the website root.
pub const RELEASES_PATH: &str = "/released-performances";

/// Runtime configuration, environment-driven with workable defaults.
/// Credentials are not part of this; clients are constructed by the caller
/// and injected.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub website_url: String,
    pub guild_id: String,
    /// Name of the channel that carries the project roster.
    pub roster_channel: String,
    /// Channel that receives scheduled drift reports and run failures.
    pub report_channel_id: String,
    /// Role mentioned ahead of a scheduled drift report.
    pub report_role_id: Option<String>,
    /// Channel that receives skipped-record notices, if any.
    pub notice_channel_id: Option<String>,
    /// Channel that receives host-response announcements.
    pub music_channel_id: String,
    pub playlist_id: String,
    pub responses_spreadsheet_id: String,
    /// Sheet with the host form responses.
    pub responses_sheet: String,
    /// Sheet holding this watcher's row cursor.
    pub state_sheet: String,
    pub drift_check_cron: String,
    pub responses_check_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self {
            website_url: std::env::var("RDW_WEBSITE_URL")
                .unwrap_or_else(|_| "https://www.untitledvirtualensemble.org".to_string()),
            guild_id: std::env::var("RDW_GUILD_ID").unwrap_or_default(),
            roster_channel: std::env::var("RDW_ROSTER_CHANNEL")
                .unwrap_or_else(|_| "current-projects".to_string()),
            report_channel_id: std::env::var("RDW_REPORT_CHANNEL_ID").unwrap_or_default(),
            report_role_id: std::env::var("RDW_REPORT_ROLE_ID").ok(),
            notice_channel_id: std::env::var("RDW_NOTICE_CHANNEL_ID").ok(),
            music_channel_id: std::env::var("RDW_MUSIC_CHANNEL_ID").unwrap_or_default(),
            playlist_id: std::env::var("RDW_PLAYLIST_ID").unwrap_or_default(),
            responses_spreadsheet_id: std::env::var("RDW_RESPONSES_SPREADSHEET_ID")
                .unwrap_or_default(),
            responses_sheet: std::env::var("RDW_RESPONSES_SHEET")
                .unwrap_or_else(|_| "Form Responses 1".to_string()),
            state_sheet: std::env::var("RDW_STATE_SHEET")
                .unwrap_or_else(|_| "Bot State".to_string()),
            drift_check_cron: std::env::var("RDW_DRIFT_CRON")
                .unwrap_or_else(|_| "0 0 12 * * *".to_string()),
            responses_check_cron: std::env::var("RDW_RESPONSES_CRON")
                .unwrap_or_else(|_| "0 1 * * * *".to_string()),
            http_timeout_secs: std::env::var("RDW_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("RDW_USER_AGENT")
                .unwrap_or_else(|_| "rdw-bot/0.1".to_string()),
        }
    }

    pub fn releases_url(&self) -> String {
        format!("{}{}", self.website_url, RELEASES_PATH)
    }
}

/// Builds the roster collection from the configured channel.
///
/// Individual malformed records are warned about (and best-effort posted to
/// the notice channel) but never abort the run; a missing roster channel
/// does.
pub async fn build_roster_projects<C: ChatClient + ?Sized>(
    chat: &C,
    config: &BotConfig,
) -> Result<Vec<Project>> {
    let channels = chat
        .guild_channels(&config.guild_id)
        .await
        .context("listing guild channels")?;
    let roster = channels
        .iter()
        .find(|c| c.name == config.roster_channel)
        .ok_or_else(|| LookupError {
            resource: format!("#{}", config.roster_channel),
        })?;

    let messages = chat
        .recent_messages(&roster.id, ROSTER_SCAN_LIMIT)
        .await
        .context("listing roster messages")?;

    let mut projects = Vec::new();
    for msg in &messages {
        match parse_roster_message(msg, &channels) {
            Ok(RecordOutcome::Project(project)) => projects.push(project),
            Ok(RecordOutcome::Skipped(_)) => {}
            Err(err) => {
                warn!(%err, message_id = %msg.id, "skipping malformed roster record");
                if let Some(notice) = &config.notice_channel_id {
                    let text = format!("could not parse roster record: {err}");
                    if let Err(post_err) = chat.post_message(notice, &text).await {
                        warn!(%post_err, "could not deliver roster record notice");
                    }
                }
            }
        }
    }
    projects.sort_by(|a, b| a.deadline.cmp(&b.deadline));
    Ok(projects)
}

/// Builds the website collection from the public listing page.
pub async fn build_website_projects(
    fetcher: &PageFetcher,
    config: &BotConfig,
    now: DateTime<Utc>,
) -> Result<Vec<Project>> {
    let html = fetcher
        .fetch_text(&config.website_url)
        .await
        .context("fetching the project listing page")?;
    let mut projects = extract_listing_projects(&html, now);
    projects.sort_by(|a, b| a.deadline.cmp(&b.deadline));
    Ok(projects)
}

/// Populates each website project's reference links from its project page.
pub async fn fetch_website_project_urls(
    fetcher: &PageFetcher,
    config: &BotConfig,
    projects: &mut [Project],
) -> Result<()> {
    for project in projects {
        let url = format!("{}{}{}", config.website_url, PROJECT_PATH_PREFIX, project.id);
        let html = fetcher
            .fetch_text(&url)
            .await
            .with_context(|| format!("fetching project page for {}", project.id))?;
        project.urls = extract_project_page_urls(&html);
    }
    Ok(())
}

/// Runs the project reconciliation: builds both collections, populates
/// website links, fetches roster pins only where the website counterpart
/// carries links, and diffs. Empty report means no drift.
pub async fn check_projects<C: ChatClient + ?Sized>(
    chat: &C,
    fetcher: &PageFetcher,
    config: &BotConfig,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut roster = build_roster_projects(chat, config).await?;
    let mut website = build_website_projects(fetcher, config, now).await?;
    fetch_website_project_urls(fetcher, config, &mut website).await?;

    let needs_pins: HashSet<&str> = website
        .iter()
        .filter(|p| !p.urls.is_empty())
        .map(|p| p.id.as_str())
        .collect();
    for project in roster.iter_mut() {
        if !needs_pins.contains(project.id.as_str()) {
            continue;
        }
        let Some(channel) = &project.channel else {
            continue;
        };
        let pinned = chat
            .pinned_messages(&channel.id)
            .await
            .with_context(|| format!("fetching pins for {}", project.id))?;
        project.urls = pinned
            .iter()
            .flat_map(|msg| extract_message_urls(&msg.content))
            .collect();
    }

    Ok(reconcile_projects(&roster, &website, now))
}

/// Runs the release reconciliation: releases page ids vs the hosted
/// playlist.
pub async fn check_releases(
    fetcher: &PageFetcher,
    videos: &VideoCatalogClient,
    config: &BotConfig,
) -> Result<String> {
    let html = fetcher
        .fetch_text(&config.releases_url())
        .await
        .context("fetching the releases page")?;
    let page_ids = extract_release_video_ids(&html);
    let playlist = videos
        .playlist_videos(&config.playlist_id)
        .await
        .context("listing the hosted playlist")?;
    Ok(reconcile_releases(&page_ids, &playlist))
}

/// `- <id> due <date>` lines for a collection, in its current order.
pub fn format_deadline_listing(projects: &[Project]) -> String {
    let mut out = String::new();
    for project in projects {
        out.push_str(&format!(
            "- {} due {}\n",
            project.id,
            project.deadline.format("%Y-%m-%d")
        ));
    }
    out
}

/// One newly submitted host form response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResponse {
    /// Announcement line for the music channel.
    pub announcement: String,
    /// Proposed piece name.
    pub name: String,
    /// Channel-name slug for the proposed piece.
    pub slug: String,
    /// Column title / cell text pairs of the raw response.
    pub fields: Vec<(String, String)>,
}

const RESPONSE_CURSOR_CELL: &str = "B3:B3";
const RESPONSE_COLUMNS_END: char = 'M';
const HOST_COLUMN: usize = 1;
const PIECE_COLUMN: usize = 8;

/// Reads host responses submitted since the stored cursor, advances the
/// cursor, and returns one announcement per response. Shape problems in the
/// state cell or the rows are fatal.
pub async fn check_host_responses(
    sheets: &SheetsClient,
    config: &BotConfig,
) -> Result<Vec<HostResponse>> {
    let cursor_range = format!("{}!{}", config.state_sheet, RESPONSE_CURSOR_CELL);
    let state = sheets
        .read_values(&config.responses_spreadsheet_id, &cursor_range, false)
        .await
        .context("reading the response cursor")?;
    let cursor_cell = state
        .first()
        .and_then(|row| row.first())
        .cloned()
        .unwrap_or(JsonValue::Null);
    let cursor = cursor_from_cell(&cursor_cell)?;

    let rows_range = format!(
        "{}!A{}:{}",
        config.responses_sheet, cursor, RESPONSE_COLUMNS_END
    );
    let rows = sheets
        .read_values(&config.responses_spreadsheet_id, &rows_range, true)
        .await
        .context("reading new host responses")?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    sheets
        .write_values(
            &config.responses_spreadsheet_id,
            &cursor_range,
            vec![vec![json!(cursor + rows.len() as i64)]],
        )
        .await
        .context("advancing the response cursor")?;

    let header_range = format!("{}!A1:{}", config.responses_sheet, RESPONSE_COLUMNS_END);
    let header = sheets
        .read_values(&config.responses_spreadsheet_id, &header_range, true)
        .await
        .context("reading the response column titles")?;
    let titles: Vec<String> = header
        .first()
        .map(|row| row.iter().map(cell_text).collect())
        .unwrap_or_default();

    let mut responses = Vec::new();
    for row in &rows {
        let mut cells: Vec<String> = row.iter().map(cell_text).collect();
        if let Some(serial) = row.first().and_then(JsonValue::as_f64) {
            // The first column is the submission instant as a sheet serial
            // date; render it as a chat timestamp tag.
            cells[0] = format!("<t:{}:f>", sheet_serial_to_datetime(serial).timestamp());
        }
        let host = cells.get(HOST_COLUMN).ok_or_else(|| short_row_error(row))?;
        let piece = cells.get(PIECE_COLUMN).ok_or_else(|| short_row_error(row))?;
        responses.push(HostResponse {
            announcement: format!("**{host}** proposes *{piece}*"),
            name: piece.clone(),
            slug: slugify(piece),
            fields: zip_pairs(&titles, &cells),
        });
    }
    Ok(responses)
}

fn short_row_error(row: &[JsonValue]) -> anyhow::Error {
    FormatError {
        context: "host response row".to_string(),
        detail: format!("expected at least {} columns, got {}", PIECE_COLUMN + 1, row.len()),
    }
    .into()
}

fn cursor_from_cell(cell: &JsonValue) -> Result<i64> {
    let parsed = match cell {
        JsonValue::String(text) => text.trim().parse::<i64>().ok(),
        JsonValue::Number(num) => num.as_i64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        FormatError {
            context: "response cursor cell".to_string(),
            detail: format!("not a row number: {cell}"),
        }
        .into()
    })
}

fn cell_text(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Sheet serial dates count days (with a fractional part) from 1899-12-30.
pub fn sheet_serial_to_datetime(serial: f64) -> DateTime<Utc> {
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)
        .expect("sheet epoch exists")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    let days = serial.trunc() as i64;
    let day_fraction_ms = (serial.fract() * 86_400_000.0).round() as i64;
    base + Duration::days(days) + Duration::milliseconds(day_fraction_ms)
}

/// Lowercases a piece name into a channel-name slug: alphanumerics kept,
/// runs of spaces and dashes collapsed to one dash, everything else dropped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in name.to_lowercase().chars() {
        if c == ' ' || c == '-' {
            pending_dash = true;
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        }
    }
    slug
}

fn zip_pairs(titles: &[String], cells: &[String]) -> Vec<(String, String)> {
    titles
        .iter()
        .zip(cells.iter())
        .map(|(t, c)| (t.clone(), c.clone()))
        .collect()
}

/// Shared handles for scheduled jobs.
#[derive(Clone)]
pub struct JobContext {
    pub chat: Arc<dyn ChatClient>,
    pub fetcher: Arc<PageFetcher>,
    pub videos: Arc<VideoCatalogClient>,
    pub sheets: Option<Arc<SheetsClient>>,
    pub config: Arc<BotConfig>,
}

/// Runs both drift checks and posts the combined report to the report
/// channel, mentioning the configured role. Failures are posted there too;
/// an empty report posts nothing.
pub async fn post_drift_report(ctx: &JobContext) {
    let now = Utc::now();
    let projects = match check_projects(ctx.chat.as_ref(), &ctx.fetcher, &ctx.config, now).await {
        Ok(report) => report,
        Err(err) => {
            error!("project check failed: {err:#}");
            let text = format!("project check error: {err:#}");
            if let Err(post_err) = ctx.chat.post_message(&ctx.config.report_channel_id, &text).await
            {
                error!(%post_err, "could not post project check failure");
            }
            return;
        }
    };
    let releases = match check_releases(&ctx.fetcher, &ctx.videos, &ctx.config).await {
        Ok(report) => report,
        Err(err) => {
            error!("release check failed: {err:#}");
            let text = format!("release check error: {err:#}");
            if let Err(post_err) = ctx.chat.post_message(&ctx.config.report_channel_id, &text).await
            {
                error!(%post_err, "could not post release check failure");
            }
            return;
        }
    };

    let combined = format!("{projects}{releases}");
    if combined.is_empty() {
        info!("drift check clean, nothing to post");
        return;
    }
    let text = match &ctx.config.report_role_id {
        Some(role) => format!("<@&{role}>\n{combined}"),
        None => combined,
    };
    if let Err(err) = ctx.chat.post_message(&ctx.config.report_channel_id, &text).await {
        error!(%err, "could not post drift report");
    }
}

/// Checks for new host responses and announces them in the music channel.
pub async fn post_host_responses(ctx: &JobContext) {
    let Some(sheets) = &ctx.sheets else {
        return;
    };
    let responses = match check_host_responses(sheets, &ctx.config).await {
        Ok(responses) => responses,
        Err(err) => {
            error!("host response check failed: {err:#}");
            let text = format!("host response check error: {err:#}");
            if let Err(post_err) = ctx.chat.post_message(&ctx.config.report_channel_id, &text).await
            {
                error!(%post_err, "could not post host response failure");
            }
            return;
        }
    };
    if responses.is_empty() {
        return;
    }
    let text = responses
        .iter()
        .map(|r| r.announcement.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if let Err(err) = ctx.chat.post_message(&ctx.config.music_channel_id, &text).await {
        error!(%err, "could not post host response announcements");
    }
}

/// Starts the cron scheduler: the daily drift check and, when a spreadsheet
/// client is available, the hourly host-response check.
pub async fn start_scheduler(ctx: JobContext) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;

    let drift_ctx = ctx.clone();
    let drift_job = Job::new_async(ctx.config.drift_check_cron.as_str(), move |_id, _lock| {
        let ctx = drift_ctx.clone();
        Box::pin(async move {
            post_drift_report(&ctx).await;
        })
    })
    .with_context(|| format!("creating drift job for cron {}", ctx.config.drift_check_cron))?;
    scheduler.add(drift_job).await.context("adding drift job")?;

    if ctx.sheets.is_some() {
        let responses_ctx = ctx.clone();
        let responses_job =
            Job::new_async(ctx.config.responses_check_cron.as_str(), move |_id, _lock| {
                let ctx = responses_ctx.clone();
                Box::pin(async move {
                    post_host_responses(&ctx).await;
                })
            })
            .with_context(|| {
                format!(
                    "creating host response job for cron {}",
                    ctx.config.responses_check_cron
                )
            })?;
        scheduler
            .add(responses_job)
            .await
            .context("adding host response job")?;
    }

    scheduler.start().await.context("starting scheduler")?;
    info!(
        drift_cron = %ctx.config.drift_check_cron,
        responses_cron = %ctx.config.responses_check_cron,
        "scheduled checks started"
    );
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn slugify_matches_channel_name_rules() {
        assert_eq!(slugify("Carol of the Bells"), "carol-of-the-bells");
        assert_eq!(slugify("Ode — an die Freude!"), "ode-an-die-freude");
        assert_eq!(slugify("Symphony No. 9"), "symphony-no-9");
        assert_eq!(slugify("already-slugged"), "already-slugged");
    }

    #[test]
    fn sheet_serials_convert_from_the_sheet_epoch() {
        // 44927 days after 1899-12-30 is 2023-01-01.
        let converted = sheet_serial_to_datetime(44927.5);
        let expected = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().unwrap();
        assert_eq!(converted, expected);
    }

    #[test]
    fn cursor_cells_accept_text_and_numbers_but_not_garbage() {
        assert_eq!(cursor_from_cell(&json!("17")).unwrap(), 17);
        assert_eq!(cursor_from_cell(&json!(17)).unwrap(), 17);
        assert!(cursor_from_cell(&json!("seventeen")).is_err());
        assert!(cursor_from_cell(&JsonValue::Null).is_err());
    }

    #[test]
    fn cursor_errors_are_format_errors() {
        let err = cursor_from_cell(&json!("n/a")).unwrap_err();
        assert!(err.downcast_ref::<FormatError>().is_some());
    }

    #[test]
    fn deadline_listing_renders_one_line_per_project() {
        let projects = vec![
            Project {
                id: "winter-carol".to_string(),
                name: "Winter Carol".to_string(),
                channel: None,
                deadline: NaiveDate::from_ymd_opt(2023, 12, 29).unwrap(),
                urls: Vec::new(),
            },
            Project {
                id: "spring-suite".to_string(),
                name: "Spring Suite".to_string(),
                channel: None,
                deadline: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                urls: Vec::new(),
            },
        ];
        assert_eq!(
            format_deadline_listing(&projects),
            "- winter-carol due 2023-12-29\n- spring-suite due 2024-03-01\n"
        );
    }

    #[test]
    fn zip_pairs_stops_at_the_shorter_side() {
        let titles = vec!["When".to_string(), "Who".to_string(), "What".to_string()];
        let cells = vec!["now".to_string(), "me".to_string()];
        assert_eq!(
            zip_pairs(&titles, &cells),
            vec![
                ("When".to_string(), "now".to_string()),
                ("Who".to_string(), "me".to_string()),
            ]
        );
    }
}
