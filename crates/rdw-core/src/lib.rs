//! Domain model, deadline-year inference, and the pure reconciliation engine.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rdw-core";

/// Grace period before a passed deadline counts as stale.
pub const STALENESS_GRACE_DAYS: i64 = 2;

/// The public listing is assumed to be refreshed at least this often; year
/// inference for listing deadlines is anchored this far in the past.
pub const LISTING_UPDATE_CADENCE_MONTHS: u32 = 1;

/// Half a year (182.5 days) in hours. Year inference never places a date
/// further than this from its reference instant (boundary exclusive).
pub const YEAR_ROLLOVER_BOUNDARY_HOURS: i64 = 4380;

/// Invite links are never pinned for non-public projects, so their absence
/// from a roster channel is not a discrepancy.
pub const INVITE_LINK_PREFIX: &str = "https://discord.gg/";

/// Playlist entries with this title are privacy-restricted and not expected
/// on the public releases page.
pub const PRIVATE_VIDEO_TITLE: &str = "Private video";

/// Reference to a chat channel. Identity and lookup only; the channel itself
/// belongs to the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
}

/// One tracked community project, as parsed from either source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// URL slug on the website, channel name in chat.
    pub id: String,
    pub name: String,
    pub channel: Option<ChannelRef>,
    pub deadline: NaiveDate,
    /// Reference links; empty until a second pass populates them.
    pub urls: Vec<String>,
}

/// One entry of the hosted video playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseVideo {
    pub video_id: String,
    pub title: String,
}

/// A malformed individual record. Recoverable: the record is skipped with a
/// warning and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("could not parse deadline for {name}: not enough words")]
    DeadlineTooShort { name: String },
    #[error("could not parse deadline for {name}: bad date {input:?}")]
    DeadlineUnparseable { name: String, input: String },
    #[error("{name} references a channel but has no deadline line")]
    DeadlineMissing { name: String },
    #[error("could not read creation timestamp of message {message_id}")]
    MessageTimestamp { message_id: String },
}

/// A required resource (channel, page) is absent. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not find {resource}")]
pub struct LookupError {
    pub resource: String,
}

/// A row or cell does not match its expected shape. Fatal only in the
/// spreadsheet path; listing entries with unexpected shapes are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected shape in {context}: {detail}")]
pub struct FormatError {
    pub context: String,
    pub detail: String,
}

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Month number for a full English month name.
pub fn month_from_full_name(name: &str) -> Option<u32> {
    MONTH_NAMES
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

/// Month number for a full or three-letter abbreviated month name; a
/// trailing period on the abbreviation is accepted (`Jan.`).
pub fn month_from_name(name: &str) -> Option<u32> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.len() == 3 {
        return MONTH_NAMES
            .iter()
            .position(|m| m[..3].eq_ignore_ascii_case(trimmed))
            .map(|i| i as u32 + 1);
    }
    month_from_full_name(trimmed)
}

/// Resolves a year-less month/day to the occurrence nearest the reference
/// instant, never more than half a year in the past.
///
/// The candidate starts in the reference year. A candidate early in the year
/// seen from late in the year rolls forward; a candidate late in the year
/// seen from early in the year rolls back. Exactly at the half-year boundary
/// the candidate stays put. `None` only when the month/day does not exist in
/// the chosen year.
pub fn resolve_nearest_year(month: u32, day: u32, reference: DateTime<Utc>) -> Option<NaiveDate> {
    let candidate = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
    let midnight = candidate.and_hms_opt(0, 0, 0).expect("midnight is always valid").and_utc();
    let boundary = Duration::hours(YEAR_ROLLOVER_BOUNDARY_HOURS);
    if candidate.month() < reference.month() && reference.signed_duration_since(midnight) > boundary
    {
        candidate.with_year(reference.year() + 1)
    } else if candidate.month() > reference.month()
        && midnight.signed_duration_since(reference) > boundary
    {
        candidate.with_year(reference.year() - 1)
    } else {
        Some(candidate)
    }
}

/// Reference instant for listing deadline years: now minus the assumed
/// update cadence of the site.
pub fn listing_year_reference(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(LISTING_UPDATE_CADENCE_MONTHS))
        .expect("one month before a real instant exists")
}

/// Whether a deadline lies more than the grace period in the past.
pub fn deadline_is_stale(deadline: NaiveDate, now: DateTime<Utc>) -> bool {
    let midnight = deadline.and_hms_opt(0, 0, 0).expect("midnight is always valid").and_utc();
    now - Duration::days(STALENESS_GRACE_DAYS) > midnight
}

/// Diffs the roster collection against the website collection.
///
/// Pure over its inputs; iteration is in ascending id order so identical
/// inputs produce byte-identical reports. An empty string means no
/// discrepancies. Roster URLs are expected to be populated (for projects
/// whose website counterpart carries URLs) before this is called.
pub fn reconcile_projects(roster: &[Project], website: &[Project], now: DateTime<Utc>) -> String {
    let roster_by_id: BTreeMap<&str, &Project> =
        roster.iter().map(|p| (p.id.as_str(), p)).collect();
    let website_by_id: BTreeMap<&str, &Project> =
        website.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut report = String::new();
    for (id, site) in &website_by_id {
        let Some(listed) = roster_by_id.get(id) else {
            let _ = writeln!(report, "- {id}: on website but not in the roster channel");
            continue;
        };
        if site.deadline != listed.deadline {
            let _ = writeln!(
                report,
                "- {id}: wrong deadline (website: {}, roster: {})",
                site.deadline.format("%Y-%m-%d"),
                listed.deadline.format("%Y-%m-%d"),
            );
        }
        if deadline_is_stale(listed.deadline, now) {
            let _ = writeln!(
                report,
                "- {id}: deadline {} has passed",
                listed.deadline.format("%Y-%m-%d"),
            );
        }
        if !site.urls.is_empty() {
            let mut pinned = listed.urls.clone();
            pinned.sort();
            for url in &site.urls {
                if pinned.binary_search(url).is_err() && !url.starts_with(INVITE_LINK_PREFIX) {
                    let _ = writeln!(report, "- {id}: URL does not appear in channel pins: {url}");
                }
            }
        }
    }
    for (id, listed) in &roster_by_id {
        if deadline_is_stale(listed.deadline, now) {
            // Finished projects are removed from the site first; not a drift.
            continue;
        }
        if !website_by_id.contains_key(id) {
            let _ = writeln!(report, "- {id}: missing on website");
        }
    }
    report
}

/// Diffs the video ids scraped from the releases page against the hosted
/// playlist. Privacy-restricted playlist entries are exempt from the
/// missing-on-website direction.
pub fn reconcile_releases(page_ids: &[String], playlist: &[ReleaseVideo]) -> String {
    let on_page: HashSet<&str> = page_ids.iter().map(String::as_str).collect();
    let in_playlist: HashSet<&str> = playlist.iter().map(|v| v.video_id.as_str()).collect();

    let mut report = String::new();
    for video in playlist {
        if video.title == PRIVATE_VIDEO_TITLE {
            continue;
        }
        if !on_page.contains(video.video_id.as_str()) {
            let _ = writeln!(
                report,
                "- {}: missing on website (https://youtu.be/{})",
                video.title, video.video_id,
            );
        }
    }
    for id in page_ids {
        if !in_playlist.contains(id.as_str()) {
            let _ = writeln!(report, "- https://youtu.be/{id} missing in playlist");
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).single().unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn project(id: &str, deadline: NaiveDate, urls: &[&str]) -> Project {
        Project {
            id: id.to_string(),
            name: id.to_string(),
            channel: None,
            deadline,
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn december_seen_from_january_resolves_to_previous_year() {
        let reference = utc(2024, 1, 10, 0, 0, 0);
        assert_eq!(resolve_nearest_year(12, 29, reference), Some(date(2023, 12, 29)));
    }

    #[test]
    fn july_seen_from_january_stays_in_the_reference_year() {
        let reference = utc(2024, 1, 10, 0, 0, 0);
        assert_eq!(resolve_nearest_year(7, 1, reference), Some(date(2024, 7, 1)));
    }

    #[test]
    fn january_seen_from_november_rolls_forward() {
        let reference = utc(2024, 11, 10, 0, 0, 0);
        assert_eq!(resolve_nearest_year(1, 5, reference), Some(date(2025, 1, 5)));
    }

    #[test]
    fn half_year_boundary_is_exclusive() {
        // 2024-01-01 00:00 + 4380h lands exactly on 2024-07-01 12:00.
        let reference = utc(2024, 7, 1, 12, 0, 0);
        assert_eq!(resolve_nearest_year(1, 1, reference), Some(date(2024, 1, 1)));
        let one_second_past = utc(2024, 7, 1, 12, 0, 1);
        assert_eq!(resolve_nearest_year(1, 1, one_second_past), Some(date(2025, 1, 1)));
    }

    #[test]
    fn abbreviated_and_full_month_names_agree() {
        assert_eq!(month_from_name("Jan."), Some(1));
        assert_eq!(month_from_name("January"), Some(1));
        assert_eq!(month_from_name("Sep"), Some(9));
        assert_eq!(month_from_name("notamonth"), None);
        // The strict parser used for roster records rejects abbreviations.
        assert_eq!(month_from_full_name("Jan"), None);
    }

    #[test]
    fn staleness_boundary_is_two_days_exclusive() {
        let deadline = date(2024, 3, 10);
        assert!(!deadline_is_stale(deadline, utc(2024, 3, 11, 0, 0, 0)));
        assert!(!deadline_is_stale(deadline, utc(2024, 3, 12, 0, 0, 0)));
        assert!(deadline_is_stale(deadline, utc(2024, 3, 12, 0, 0, 1)));
    }

    #[test]
    fn deadline_mismatch_reports_both_values() {
        let now = utc(2024, 3, 1, 0, 0, 0);
        let roster = vec![project("alpha", date(2024, 3, 10), &[])];
        let website = vec![project("alpha", date(2024, 3, 12), &[])];
        let report = reconcile_projects(&roster, &website, now);
        assert_eq!(
            report,
            "- alpha: wrong deadline (website: 2024-03-12, roster: 2024-03-10)\n"
        );
    }

    #[test]
    fn passed_deadline_is_flagged_even_when_still_listed_on_both_sides() {
        let now = utc(2024, 3, 20, 0, 0, 0);
        let roster = vec![project("alpha", date(2024, 3, 10), &[])];
        let website = vec![project("alpha", date(2024, 3, 10), &[])];
        let report = reconcile_projects(&roster, &website, now);
        assert_eq!(report, "- alpha: deadline 2024-03-10 has passed\n");
    }

    #[test]
    fn url_containment_exempts_invite_links() {
        let now = utc(2024, 3, 1, 0, 0, 0);
        let roster = vec![project(
            "alpha",
            date(2024, 3, 10),
            &["https://example.org/score.pdf"],
        )];
        let website = vec![project(
            "alpha",
            date(2024, 3, 10),
            &[
                "https://example.org/score.pdf",
                "https://discord.gg/abcdef",
                "https://example.org/reference-track",
            ],
        )];
        let report = reconcile_projects(&roster, &website, now);
        assert_eq!(
            report,
            "- alpha: URL does not appear in channel pins: https://example.org/reference-track\n"
        );
    }

    #[test]
    fn url_check_skipped_when_website_has_no_urls() {
        let now = utc(2024, 3, 1, 0, 0, 0);
        let roster = vec![project("alpha", date(2024, 3, 10), &["https://example.org/x"])];
        let website = vec![project("alpha", date(2024, 3, 10), &[])];
        assert_eq!(reconcile_projects(&roster, &website, now), "");
    }

    #[test]
    fn missing_sides_are_reported_in_ascending_id_order() {
        let now = utc(2024, 3, 1, 0, 0, 0);
        let roster = vec![
            project("zeta", date(2024, 4, 1), &[]),
            project("beta", date(2024, 3, 10), &[]),
        ];
        let website = vec![
            project("gamma", date(2024, 3, 12), &[]),
            project("alpha", date(2024, 3, 11), &[]),
        ];
        let report = reconcile_projects(&roster, &website, now);
        assert_eq!(
            report,
            "- alpha: on website but not in the roster channel\n\
             - gamma: on website but not in the roster channel\n\
             - beta: missing on website\n\
             - zeta: missing on website\n"
        );
    }

    #[test]
    fn stale_roster_project_absent_from_website_is_ignored() {
        let now = utc(2024, 3, 20, 0, 0, 0);
        let roster = vec![project("done", date(2024, 3, 10), &[])];
        let website = Vec::new();
        assert_eq!(reconcile_projects(&roster, &website, now), "");
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let now = utc(2024, 3, 5, 0, 0, 0);
        let roster = vec![
            project("alpha", date(2024, 3, 10), &["https://example.org/a"]),
            project("beta", date(2024, 2, 1), &[]),
        ];
        let website = vec![
            project("alpha", date(2024, 3, 12), &["https://example.org/b"]),
            project("gamma", date(2024, 4, 1), &[]),
        ];
        let first = reconcile_projects(&roster, &website, now);
        let second = reconcile_projects(&roster, &website, now);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn private_playlist_videos_are_not_expected_on_the_website() {
        let page_ids = vec!["aaaaaaaaaaa".to_string()];
        let playlist = vec![
            ReleaseVideo {
                video_id: "aaaaaaaaaaa".to_string(),
                title: "Spring Concert".to_string(),
            },
            ReleaseVideo {
                video_id: "bbbbbbbbbbb".to_string(),
                title: "Private video".to_string(),
            },
        ];
        assert_eq!(reconcile_releases(&page_ids, &playlist), "");
    }

    #[test]
    fn page_ids_absent_from_the_playlist_are_always_reported() {
        let page_ids = vec!["ccccccccccc".to_string()];
        let playlist = vec![ReleaseVideo {
            video_id: "ddddddddddd".to_string(),
            title: "Winter Concert".to_string(),
        }];
        let report = reconcile_releases(&page_ids, &playlist);
        assert_eq!(
            report,
            "- Winter Concert: missing on website (https://youtu.be/ddddddddddd)\n\
             - https://youtu.be/ccccccccccc missing in playlist\n"
        );
    }
}
