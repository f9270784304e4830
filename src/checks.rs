//! Bodies of the scheduled checks and the UI-side state that interprets
//! their results.

use std::{cmp::Ordering, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use reqwest::blocking::Client;
use semver::Version;
use tracing::{debug, info};

use crate::cache::{PurgeReport, ResultCache};

/// Source of the published version tags for a package.
pub trait ReleaseSource: Send + Sync {
    fn tags(&self, package: &str) -> Result<Vec<String>>;
}

/// Reads a JSON array of tag strings from `<feed>/<package>`.
pub struct HttpReleaseFeed {
    client: Client,
    feed_url: String,
}

impl HttpReleaseFeed {
    pub fn new(feed_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client for release feed")?;
        Ok(Self {
            client,
            feed_url: feed_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ReleaseSource for HttpReleaseFeed {
    fn tags(&self, package: &str) -> Result<Vec<String>> {
        let url = format!("{}/{}", self.feed_url, package);
        let response = self
            .client
            .get(url)
            .send()
            .context("Failed to reach release feed")?
            .error_for_status()
            .context("Release feed returned an error status")?;
        response
            .json::<Vec<String>>()
            .context("Failed to parse release feed response")
    }
}

fn parse_tag(tag: &str) -> Option<Version> {
    Version::parse(tag.trim().trim_start_matches('v')).ok()
}

/// Orders tags by semver where both parse; semver tags sort after plain ones,
/// plain tags compare lexically.
pub fn compare_tags(a: &str, b: &str) -> Ordering {
    match (parse_tag(a), parse_tag(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

pub fn latest_tag(tags: &[String]) -> Option<&str> {
    tags.iter()
        .max_by(|a, b| compare_tags(a, b))
        .map(String::as_str)
}

/// Returns the newer tag when the running tag is not the latest published one.
pub fn check_for_update(
    source: &dyn ReleaseSource,
    package: &str,
    current_tag: &str,
) -> Result<Option<String>> {
    let tags = source.tags(package)?;
    let latest = match latest_tag(&tags) {
        Some(latest) => latest,
        None => return Ok(None),
    };
    debug!(package, current_tag, latest, "update check");
    if latest != current_tag {
        Ok(Some(latest.to_string()))
    } else {
        Ok(None)
    }
}

pub fn clean_cache(cache: &ResultCache, retention: Duration) -> Result<PurgeReport> {
    let report = cache
        .purge_older_than(retention)
        .with_context(|| format!("Failed to purge {}", cache.dir().display()))?;
    if report.removed > 0 {
        info!(removed = report.removed, "purged stale cache entries");
    }
    Ok(report)
}

/// Tracks reachability so that only transitions cause work.
#[derive(Debug, Default)]
pub struct StatusTracker {
    online: Option<bool>,
    last_change: Option<DateTime<Local>>,
}

impl StatusTracker {
    /// Returns true when `online` differs from the previous observation.
    pub fn observe(&mut self, online: bool) -> bool {
        if self.online == Some(online) {
            return false;
        }
        self.online = Some(online);
        self.last_change = Some(Local::now());
        true
    }

    pub fn current(&self) -> Option<bool> {
        self.online
    }

    pub fn last_change(&self) -> Option<DateTime<Local>> {
        self.last_change
    }
}

/// "New version available" notice, shown once per process.
#[derive(Debug, Default)]
pub struct UpdateNotice {
    shown: Option<(String, DateTime<Local>)>,
}

impl UpdateNotice {
    /// Returns the message to display the first time an update is seen.
    pub fn offer(&mut self, latest: &str) -> Option<String> {
        if self.shown.is_some() {
            return None;
        }
        self.shown = Some((latest.to_string(), Local::now()));
        Some(format!("A new version ({latest}) is available; restart to upgrade."))
    }

    pub fn latest(&self) -> Option<&str> {
        self.shown.as_ref().map(|(tag, _)| tag.as_str())
    }
}
