//! Source adapters: turn crawler capture files into [`RawListing`]s.
//!
//! Crawlers run out-of-process and save what they fetched as a capture
//! bundle (a small JSON manifest next to the raw page). Adapters own the
//! source-specific extraction: Seek captures are result-page HTML, Prosple
//! captures are the JSON card data the crawler lifted from the side panel.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gradscout_core::{OneOrMany, ProspleListing, RawListing, SeekListing, SourceTag};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "gradscout-adapters";

/// Manifest written by a crawler next to the page it saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBundle {
    pub source: SourceTag,
    pub captured_from_url: String,
    pub captured_at: DateTime<Utc>,
    pub content_type: String,
    /// Path of the raw artifact, relative to the bundle file.
    #[serde(default)]
    pub raw_path: Option<String>,
    /// Raw artifact inlined into the bundle; takes precedence over
    /// `raw_path` when both are set.
    #[serde(default)]
    pub inline_text: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CaptureBundle {
    pub fn raw_text(&self) -> Option<&str> {
        self.inline_text.as_deref()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub trait SourceAdapter: Send + Sync {
    fn source_tag(&self) -> SourceTag;
    fn parse_capture(&self, bundle: &CaptureBundle) -> Result<Vec<RawListing>, AdapterError>;
}

/// Reads a capture bundle and hydrates `inline_text` from `raw_path`
/// (resolved relative to the bundle file) when the raw page was saved
/// alongside instead of inlined.
pub fn load_capture_bundle(path: impl AsRef<Path>) -> Result<CaptureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut bundle: CaptureBundle =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;

    if bundle.inline_text.is_none() {
        if let Some(rel_path) = &bundle.raw_path {
            let raw_path = path.parent().unwrap_or_else(|| Path::new(".")).join(rel_path);
            let raw = fs::read_to_string(&raw_path)
                .with_context(|| format!("reading capture raw artifact {}", raw_path.display()))?;
            bundle.inline_text = Some(raw);
        }
    }
    Ok(bundle)
}

fn check_source(bundle: &CaptureBundle, expected: SourceTag) -> Result<(), AdapterError> {
    if bundle.source != expected {
        return Err(AdapterError::Message(format!(
            "bundle source={} does not match adapter source={}",
            bundle.source, expected
        )));
    }
    Ok(())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn first_text(scope: &ElementRef, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn all_texts(scope: &ElementRef, selector: &Selector) -> Vec<String> {
    scope
        .select(selector)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn first_attr(scope: &ElementRef, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Parses saved Seek result-page HTML. One `article[data-job-id]` card per
/// listing; fields hang off Seek's stable `data-automation` attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekAdapter;

struct SeekSelectors {
    card: Selector,
    title: Selector,
    company: Selector,
    location: Selector,
    salary: Selector,
    short_description: Selector,
    listing_date: Selector,
    premium: Selector,
    classification: Selector,
    sub_classification: Selector,
    detail: Selector,
}

impl SeekSelectors {
    fn build() -> Result<Self, AdapterError> {
        Ok(Self {
            card: parse_selector("article[data-job-id]")?,
            title: parse_selector(r#"a[data-automation="jobTitle"]"#)?,
            company: parse_selector(r#"[data-automation="jobCompany"]"#)?,
            location: parse_selector(r#"[data-automation="jobLocation"]"#)?,
            salary: parse_selector(r#"[data-automation="jobSalary"]"#)?,
            short_description: parse_selector(r#"[data-automation="jobShortDescription"]"#)?,
            listing_date: parse_selector(r#"[data-automation="jobListingDate"]"#)?,
            premium: parse_selector(r#"[data-automation="jobPremium"]"#)?,
            classification: parse_selector(r#"[data-automation="jobClassification"]"#)?,
            sub_classification: parse_selector(r#"[data-automation="jobSubClassification"]"#)?,
            detail: parse_selector(r#"[data-automation="jobAdDetails"]"#)?,
        })
    }
}

impl SourceAdapter for SeekAdapter {
    fn source_tag(&self) -> SourceTag {
        SourceTag::Seek
    }

    fn parse_capture(&self, bundle: &CaptureBundle) -> Result<Vec<RawListing>, AdapterError> {
        check_source(bundle, SourceTag::Seek)?;
        let Some(html_text) = bundle.raw_text() else {
            return Err(AdapterError::Message(
                "seek capture bundle has no raw HTML".into(),
            ));
        };

        let selectors = SeekSelectors::build()?;
        let document = Html::parse_document(html_text);
        let mut listings = Vec::new();

        for card in document.select(&selectors.card) {
            let Some(title) = first_text(&card, &selectors.title) else {
                // Sponsored shells and ad slots reuse the article element
                // without a title link.
                continue;
            };
            let company =
                first_text(&card, &selectors.company).unwrap_or_else(|| "Private Advertiser".into());
            let locations = all_texts(&card, &selectors.location);
            let url = first_attr(&card, &selectors.title, "href")
                .map(|href| absolutize_seek_url(&href));

            listings.push(RawListing::Seek(SeekListing {
                job_id: card.value().attr("data-job-id").map(ToString::to_string),
                title,
                company,
                locations: OneOrMany::Many(locations),
                work_arrangement: None,
                salary: first_text(&card, &selectors.salary),
                description: first_text(&card, &selectors.short_description),
                // Detail-panel text is only present when the crawler
                // expanded the card before saving.
                full_description: first_text(&card, &selectors.detail),
                listing_date: first_text(&card, &selectors.listing_date),
                url,
                is_premium: card.select(&selectors.premium).next().is_some(),
                classification: first_text(&card, &selectors.classification),
                sub_classification: first_text(&card, &selectors.sub_classification),
            }));
        }

        Ok(listings)
    }
}

fn absolutize_seek_url(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("https://www.seek.com.au{href}")
    }
}

/// Parses Prosple captures: the crawler extracts side-panel card data as a
/// JSON array of listing objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProspleAdapter;

impl SourceAdapter for ProspleAdapter {
    fn source_tag(&self) -> SourceTag {
        SourceTag::Prosple
    }

    fn parse_capture(&self, bundle: &CaptureBundle) -> Result<Vec<RawListing>, AdapterError> {
        check_source(bundle, SourceTag::Prosple)?;
        let Some(text) = bundle.raw_text() else {
            return Err(AdapterError::Message(
                "prosple capture bundle has no raw JSON".into(),
            ));
        };

        let cards: Vec<ProspleListing> = serde_json::from_str(text)
            .map_err(|e| AdapterError::Message(format!("invalid prosple capture JSON: {e}")))?;
        Ok(cards.into_iter().map(RawListing::Prosple).collect())
    }
}

pub fn adapter_for(tag: SourceTag) -> Box<dyn SourceAdapter> {
    match tag {
        SourceTag::Seek => Box::new(SeekAdapter),
        SourceTag::Prosple => Box::new(ProspleAdapter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradscout_core::DateText;

    fn bundle(source: SourceTag, content_type: &str, inline: &str) -> CaptureBundle {
        CaptureBundle {
            source,
            captured_from_url: "https://example.test/listing".into(),
            captured_at: Utc::now(),
            content_type: content_type.into(),
            raw_path: None,
            inline_text: Some(inline.into()),
            notes: None,
        }
    }

    const SEEK_HTML: &str = r#"
        <html><body>
        <article data-job-id="81234567">
          <a data-automation="jobTitle" href="/job/81234567">Graduate Software Engineer</a>
          <span data-automation="jobCompany">Acme Pty Ltd</span>
          <span data-automation="jobLocation">Sydney NSW</span>
          <span data-automation="jobLocation">Remote</span>
          <span data-automation="jobSalary">$80,000 - $95,000</span>
          <span data-automation="jobShortDescription">Join our graduate program.</span>
          <span data-automation="jobListingDate">3d ago</span>
          <span data-automation="jobClassification">Information Technology</span>
        </article>
        <article data-job-id="81234568">
          <a data-automation="jobTitle" href="https://www.seek.com.au/job/81234568">Junior Data Analyst</a>
          <span data-automation="jobCompany">Beta Corp</span>
          <span data-automation="jobLocation">Melbourne VIC</span>
          <span data-automation="jobPremium">Featured</span>
        </article>
        <article data-job-id="81234569"><div>ad slot, no title</div></article>
        </body></html>
    "#;

    #[test]
    fn seek_adapter_extracts_card_fields() {
        let bundle = bundle(SourceTag::Seek, "text/html", SEEK_HTML);
        let listings = SeekAdapter.parse_capture(&bundle).expect("parse");
        assert_eq!(listings.len(), 2);

        let RawListing::Seek(first) = &listings[0] else {
            panic!("expected seek listing");
        };
        assert_eq!(first.job_id.as_deref(), Some("81234567"));
        assert_eq!(first.title, "Graduate Software Engineer");
        assert_eq!(first.company, "Acme Pty Ltd");
        assert_eq!(first.locations.join(", "), "Sydney NSW, Remote");
        assert_eq!(first.salary.as_deref(), Some("$80,000 - $95,000"));
        assert_eq!(first.description.as_deref(), Some("Join our graduate program."));
        assert_eq!(first.listing_date.as_deref(), Some("3d ago"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://www.seek.com.au/job/81234567")
        );
        assert!(!first.is_premium);
        assert_eq!(
            first.classification.as_deref(),
            Some("Information Technology")
        );

        let RawListing::Seek(second) = &listings[1] else {
            panic!("expected seek listing");
        };
        assert!(second.is_premium);
        assert_eq!(
            second.url.as_deref(),
            Some("https://www.seek.com.au/job/81234568")
        );
    }

    #[test]
    fn seek_adapter_rejects_mismatched_bundle() {
        let bundle = bundle(SourceTag::Prosple, "text/html", SEEK_HTML);
        assert!(SeekAdapter.parse_capture(&bundle).is_err());
    }

    const PROSPLE_JSON: &str = r#"[
        {
          "title": "Graduate Program 2027",
          "company": "Gamma Group",
          "locations": ["Sydney", "Brisbane"],
          "salary": "AUD 75,000",
          "start_date": "2027-02-01",
          "url": "https://au.prosple.com/graduate-program-2027",
          "badges": ["Accepting international applicants"],
          "full_description": "A rotational graduate program.\nApplications close soon."
        },
        {
          "title": "Summer Internship",
          "company": "Delta Labs",
          "locations": "Perth",
          "start_date": "ASAP"
        }
    ]"#;

    #[test]
    fn prosple_adapter_parses_structured_and_free_text_dates() {
        let bundle = bundle(SourceTag::Prosple, "application/json", PROSPLE_JSON);
        let listings = ProspleAdapter.parse_capture(&bundle).expect("parse");
        assert_eq!(listings.len(), 2);

        let RawListing::Prosple(first) = &listings[0] else {
            panic!("expected prosple listing");
        };
        assert!(matches!(first.start_date, Some(DateText::Date(_))));
        assert_eq!(first.locations.join(", "), "Sydney, Brisbane");

        let RawListing::Prosple(second) = &listings[1] else {
            panic!("expected prosple listing");
        };
        assert_eq!(second.start_date, Some(DateText::Text("ASAP".into())));
        assert_eq!(second.locations.join(", "), "Perth");
        assert!(second.url.is_none());
    }

    #[test]
    fn capture_bundle_hydrates_raw_artifact_relative_to_bundle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(dir.join("listing.html"), SEEK_HTML).expect("write raw");
        let manifest = serde_json::json!({
            "source": "seek",
            "captured_from_url": "https://www.seek.com.au/graduate-jobs",
            "captured_at": "2026-08-01T07:00:00Z",
            "content_type": "text/html",
            "raw_path": "listing.html"
        });
        let bundle_path = dir.join("bundle.json");
        fs::write(&bundle_path, manifest.to_string()).expect("write bundle");

        let bundle = load_capture_bundle(&bundle_path).expect("load");
        assert!(bundle.inline_text.is_some());
        let listings = SeekAdapter.parse_capture(&bundle).expect("parse");
        assert_eq!(listings.len(), 2);
    }
}
