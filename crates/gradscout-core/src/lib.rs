//! Core domain model and fingerprint identity for gradscout.
//!
//! A listing's identity is a SHA-256 digest over a normalized five-field
//! projection (title, company, url, date, description). The digest doubles
//! as the storage key, so deduplication is content-addressed rather than
//! assigned.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "gradscout-core";

/// Which job board a raw listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Seek,
    Prosple,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Seek => "seek",
            SourceTag::Prosple => "prosple",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts either a scalar or a list; job boards are inconsistent about
/// whether a listing has one location or several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany<String> {
    pub fn join(&self, sep: &str) -> String {
        match self {
            OneOrMany::One(value) => value.clone(),
            OneOrMany::Many(values) => values.join(sep),
        }
    }
}

/// A date-like field that may be structured (`2026-03-02`) or free text
/// (`"3d ago"`, `"ASAP"`). Free text is never parsed semantically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateText {
    Date(NaiveDate),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeekListing {
    #[serde(default)]
    pub job_id: Option<String>,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub locations: OneOrMany<String>,
    #[serde(default)]
    pub work_arrangement: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    /// Short description from the result card.
    #[serde(default)]
    pub description: Option<String>,
    /// Full description from the detail panel, when the crawler opened it.
    #[serde(default)]
    pub full_description: Option<String>,
    /// Free text such as "3d ago"; Seek does not expose a structured date.
    #[serde(default)]
    pub listing_date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub sub_classification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProspleListing {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub locations: OneOrMany<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateText>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default)]
    pub timing_info: Option<String>,
    #[serde(default)]
    pub full_description: Option<String>,
}

/// Raw listing as handed over by a crawler, discriminated by source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum RawListing {
    Seek(SeekListing),
    Prosple(ProspleListing),
}

impl RawListing {
    pub fn source_tag(&self) -> SourceTag {
        match self {
            RawListing::Seek(_) => SourceTag::Seek,
            RawListing::Prosple(_) => SourceTag::Prosple,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            RawListing::Seek(l) => &l.title,
            RawListing::Prosple(l) => &l.title,
        }
    }

    pub fn company(&self) -> &str {
        match self {
            RawListing::Seek(l) => &l.company,
            RawListing::Prosple(l) => &l.company,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            RawListing::Seek(l) => l.url.as_deref(),
            RawListing::Prosple(l) => l.url.as_deref(),
        }
    }

    pub fn salary(&self) -> Option<&str> {
        match self {
            RawListing::Seek(l) => l.salary.as_deref(),
            RawListing::Prosple(l) => l.salary.as_deref(),
        }
    }

    pub fn location_display(&self) -> String {
        match self {
            RawListing::Seek(l) => l.locations.join(", "),
            RawListing::Prosple(l) => l.locations.join(", "),
        }
    }

    /// Human-facing date column for the spreadsheet row.
    pub fn date_display(&self) -> String {
        match self {
            RawListing::Seek(l) => l.listing_date.clone().unwrap_or_default(),
            RawListing::Prosple(l) => match &l.start_date {
                Some(DateText::Date(d)) => d.format("%Y-%m-%d").to_string(),
                Some(DateText::Text(t)) => t.clone(),
                None => String::new(),
            },
        }
    }

    /// Short description for the spreadsheet row. Seek has a dedicated card
    /// blurb; for Prosple the first paragraph of the full description is
    /// truncated to 200 characters.
    pub fn short_description(&self) -> String {
        match self {
            RawListing::Seek(l) => l.description.clone().unwrap_or_default(),
            RawListing::Prosple(l) => {
                let full = l.full_description.as_deref().unwrap_or_default();
                let first_paragraph = full.split('\n').next().unwrap_or_default();
                truncate_chars(first_paragraph, 200)
            }
        }
    }

    /// Project to the five-field identity shape. Total: missing optional
    /// fields normalize to the empty string.
    pub fn canonicalize(&self) -> CanonicalListing {
        match self {
            RawListing::Seek(l) => CanonicalListing {
                title: normalize_text(&l.title),
                company: normalize_text(&l.company),
                url: normalize_text(l.url.as_deref().unwrap_or_default()),
                date: l
                    .listing_date
                    .as_deref()
                    .map(|t| normalize_date(&DateText::Text(t.to_string())))
                    .unwrap_or_default(),
                description: normalize_text(preferred_description(
                    l.full_description.as_deref(),
                    l.description.as_deref(),
                )),
            },
            RawListing::Prosple(l) => CanonicalListing {
                title: normalize_text(&l.title),
                company: normalize_text(&l.company),
                url: normalize_text(l.url.as_deref().unwrap_or_default()),
                date: l.start_date.as_ref().map(normalize_date).unwrap_or_default(),
                description: normalize_text(preferred_description(
                    l.full_description.as_deref(),
                    None,
                )),
            },
        }
    }
}

fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max).collect();
    out.push_str("...");
    out
}

/// Full description wins when it is present and non-blank, else the short
/// description, else empty.
fn preferred_description<'a>(full: Option<&'a str>, short: Option<&'a str>) -> &'a str {
    match full {
        Some(f) if !f.trim().is_empty() => f,
        _ => short.unwrap_or_default(),
    }
}

/// Normalized five-field projection used to compute the fingerprint.
/// Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalListing {
    pub title: String,
    pub company: String,
    pub url: String,
    pub date: String,
    pub description: String,
}

impl CanonicalListing {
    /// Joined with a delimiter not expected to survive normalization.
    pub fn identity_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.title, self.company, self.url, self.date, self.description
        )
    }
}

/// Lowercase, drop everything that is neither alphanumeric nor whitespace,
/// then collapse whitespace runs to single spaces and trim.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Structured dates render as `YYYY-MM-DD`; free text is lowercased and
/// stripped of whitespace, compared literally.
pub fn normalize_date(date: &DateText) -> String {
    match date {
        DateText::Date(d) => d.format("%Y-%m-%d").to_string(),
        DateText::Text(t) => t
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect(),
    }
}

/// Content-hash identity of a listing: 64 lowercase hex chars of SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest, e.g. recovered from a file name.
    pub fn from_hex(digest: impl Into<String>) -> Self {
        Fingerprint(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading eight hex chars, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic identity hash of a raw listing. Pure: no I/O, no
/// randomness, no dependence on insertion order.
pub fn fingerprint(listing: &RawListing) -> Fingerprint {
    let canonical = listing.canonicalize();
    let mut hasher = Sha256::new();
    hasher.update(canonical.identity_string().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Persisted listing document, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub pushed: bool,
    pub listing: RawListing,
}

impl ListingRecord {
    pub fn source(&self) -> SourceTag {
        self.listing.source_tag()
    }
}

/// Persisted, append-only audit record of one completed export cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: String,
    pub spreadsheet_id: String,
    pub spreadsheet_url: String,
    pub export_date: DateTime<Utc>,
    pub job_count: usize,
    pub fingerprints: Vec<Fingerprint>,
}
