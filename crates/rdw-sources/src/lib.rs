//! Record parsing and link extraction over fetched chat and website content.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rdw_clients::{snowflake_timestamp, Channel, Message};
use rdw_core::{
    listing_year_reference, month_from_full_name, month_from_name, resolve_nearest_year,
    ChannelRef, ParseError, Project,
};
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

pub const CRATE_NAME: &str = "rdw-sources";

/// Label opening a deadline line in a roster message.
pub const DEADLINE_LABEL: &str = "Deadline: ";

/// Placeholder marking a roster record that is deliberately untracked.
pub const DEADLINE_PLACEHOLDER: &str = "--";

/// Opening of an embedded channel reference (`<#123456789>`).
pub const CHANNEL_REF_PREFIX: &str = "<#";

/// Path prefix of project links on the listing page; the id is the segment
/// after it.
pub const PROJECT_PATH_PREFIX: &str = "/projects/";

/// Title prefix of listing entries (`Due Jan. 5 - Name`).
pub const DUE_PREFIX: &str = "Due ";

/// Redirect-wrapper hrefs carry the true destination in their `q` parameter.
pub const REDIRECT_WRAPPER_PREFIX: &str = "https://www.google.com/url?q=";

/// CSS selector for the body section of a project page that carries the
/// reference links.
pub const PROJECT_BODY_LINKS_SELECTOR: &str = "div[role=main] section:nth-child(2) a";

/// Why a roster record was deliberately left out of the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The record carries the `--` deadline placeholder (tracked elsewhere).
    DeadlinePlaceholder,
    /// No line resolved to a known channel.
    NoChannelRef,
}

/// Outcome of parsing one roster record: either a project or an explicit
/// skip. Malformed records are a separate `Err` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Skipped(SkipReason),
    Project(Project),
}

fn strip_ordinal_suffix(token: &str) -> &str {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(stripped) = token.strip_suffix(suffix) {
            return stripped;
        }
    }
    token
}

/// Parses one roster channel message into a [`RecordOutcome`].
///
/// The first line is the project name. A `Deadline: ` line carries
/// `<Month> <day>` (full month name, ordinal suffix on the day tolerated),
/// resolved to a year relative to the message's creation instant. A `<#...>`
/// line names the project channel; its channel name becomes the project id.
pub fn parse_roster_message(
    msg: &Message,
    channels: &[Channel],
) -> Result<RecordOutcome, ParseError> {
    let name = msg.content.lines().next().unwrap_or("").to_string();
    let mut channel: Option<ChannelRef> = None;
    let mut deadline = None;

    for line in msg.content.lines() {
        if let Some(rest) = line.strip_prefix(DEADLINE_LABEL) {
            let mut words = rest.split_whitespace();
            let month_token = words.next().ok_or_else(|| ParseError::DeadlineTooShort {
                name: name.clone(),
            })?;
            if month_token == DEADLINE_PLACEHOLDER {
                return Ok(RecordOutcome::Skipped(SkipReason::DeadlinePlaceholder));
            }
            let day_token = words.next().ok_or_else(|| ParseError::DeadlineTooShort {
                name: name.clone(),
            })?;
            let day_token = strip_ordinal_suffix(day_token);

            let unparseable = || ParseError::DeadlineUnparseable {
                name: name.clone(),
                input: rest.to_string(),
            };
            let month = month_from_full_name(month_token).ok_or_else(unparseable)?;
            let day: u32 = day_token.parse().map_err(|_| unparseable())?;

            let created =
                snowflake_timestamp(&msg.id).ok_or_else(|| ParseError::MessageTimestamp {
                    message_id: msg.id.clone(),
                })?;
            deadline = Some(resolve_nearest_year(month, day, created).ok_or_else(unparseable)?);
        } else if let Some(rest) = line.strip_prefix(CHANNEL_REF_PREFIX) {
            let cid = rest.trim_matches(|c| matches!(c, '<' | '#' | '>' | ' '));
            if let Some(known) = channels.iter().find(|c| c.id == cid) {
                channel = Some(ChannelRef {
                    id: known.id.clone(),
                    name: known.name.clone(),
                });
            }
        }
    }

    match (channel, deadline) {
        (Some(channel), Some(deadline)) => Ok(RecordOutcome::Project(Project {
            id: channel.name.clone(),
            name,
            channel: Some(channel),
            deadline,
            urls: Vec::new(),
        })),
        (None, _) => Ok(RecordOutcome::Skipped(SkipReason::NoChannelRef)),
        (Some(_), None) => Err(ParseError::DeadlineMissing { name }),
    }
}

/// Parses one listing link (title text + href) into a project, or `None`
/// for entries that are not project links. The listing is known to contain
/// unrelated links with the same href prefix, so every malformed title is a
/// silent skip rather than an error.
pub fn parse_listing_entry(title: &str, href: &str, now: DateTime<Utc>) -> Option<Project> {
    let (due, name) = title.split_once(" - ")?;
    let rest = due.strip_prefix(DUE_PREFIX)?;
    let mut words = rest.split_whitespace();
    let month = month_from_name(words.next()?)?;
    let day: u32 = words.next()?.parse().ok()?;
    let id = href.strip_prefix(PROJECT_PATH_PREFIX)?;
    if id.is_empty() {
        return None;
    }
    let deadline = resolve_nearest_year(month, day, listing_year_reference(now))?;
    Some(Project {
        id: id.to_string(),
        name: name.to_string(),
        channel: None,
        deadline,
        urls: Vec::new(),
    })
}

/// Extracts every project entry from the listing page markup.
pub fn extract_listing_projects(html: &str, now: DateTime<Utc>) -> Vec<Project> {
    static PROJECT_LINKS: LazyLock<Selector> = LazyLock::new(|| {
        Selector::parse(r#"a[href^="/projects/"]"#).expect("static selector parses")
    });
    let document = Html::parse_document(html);
    document
        .select(&PROJECT_LINKS)
        .filter_map(|link| {
            let href = link.value().attr("href")?;
            let title = link.text().collect::<String>();
            parse_listing_entry(title.trim(), href, now)
        })
        .collect()
}

/// Collects the reference links of one project page's body section,
/// unwrapping redirect-wrapper hrefs to their true destination.
pub fn extract_project_page_urls(html: &str) -> Vec<String> {
    static BODY_LINKS: LazyLock<Selector> = LazyLock::new(|| {
        Selector::parse(PROJECT_BODY_LINKS_SELECTOR).expect("static selector parses")
    });
    let document = Html::parse_document(html);
    document
        .select(&BODY_LINKS)
        .filter_map(|link| link.value().attr("href"))
        .map(unwrap_redirect)
        .collect()
}

fn unwrap_redirect(href: &str) -> String {
    if href.starts_with(REDIRECT_WRAPPER_PREFIX) {
        if let Ok(wrapped) = Url::parse(href) {
            if let Some((_, destination)) = wrapped.query_pairs().find(|(key, _)| key == "q") {
                return destination.into_owned();
            }
        }
    }
    href.to_string()
}

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s*]+").expect("static regex compiles"));

/// Scans message text for URLs. The `*` exclusion keeps markdown bold
/// delimiters out of matched URLs; a single trailing period is stripped.
pub fn extract_message_urls(content: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(content)
        .map(|m| {
            let url = m.as_str();
            url.strip_suffix('.').unwrap_or(url).to_string()
        })
        .collect()
}

static VIDEO_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?)/|.*[?&]v=)|youtu\.be/)([^"&?/\s]{11})"#,
    )
    .expect("static regex compiles")
});

/// Extracts hosted-video ids from every hyperlink of the releases page.
pub fn extract_release_video_ids(html: &str) -> Vec<String> {
    static ALL_LINKS: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("a").expect("static selector parses"));
    let document = Html::parse_document(html);
    document
        .select(&ALL_LINKS)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| {
            VIDEO_ID_PATTERN
                .captures(href)
                .and_then(|caps| caps.get(1))
                .map(|id| id.as_str().to_string())
        })
        .collect()
}
