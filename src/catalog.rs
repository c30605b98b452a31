use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, ExtractError};
use crate::fetch::Fetcher;
use crate::models::{AvailabilityState, CatalogItem, ResolvedStream};

/// Stream metadata replies are JSON; anything shorter than `{}` is garbage.
pub const MIN_JSON_SIZE: usize = 2;

/// Embed pages that are smaller than this cannot hold a player script.
const MIN_EMBED_SIZE: usize = 64;

/// `atob("...")` or `atob('...')`, whitespace tolerant.
static ATOB_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"atob\s*\(\s*(?:"([^"]*)"|'([^']*)')\s*\)"#).expect("static regex")
});

/// How a catalog source reports whether an event is on air.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStrategy {
    /// Substring match on the free-text release info.
    ReleaseInfo,
    /// Compare the (skew-adjusted) start time with the current time.
    StartWindow { upcoming_threshold: chrono::Duration },
}

impl AvailabilityStrategy {
    pub fn classify(
        &self,
        release_info: &str,
        starts_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AvailabilityState {
        match self {
            AvailabilityStrategy::ReleaseInfo => {
                if release_info.contains("Live") {
                    AvailabilityState::Live
                } else if release_info.contains("Upcoming") {
                    AvailabilityState::Upcoming
                } else {
                    AvailabilityState::Available
                }
            }
            AvailabilityStrategy::StartWindow { upcoming_threshold } => match starts_at {
                Some(start) if start - now > *upcoming_threshold => AvailabilityState::Upcoming,
                Some(_) => AvailabilityState::Live,
                None => AvailabilityState::Unknown,
            },
        }
    }
}

/// Per-source interpretation rules for catalog metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProfile {
    pub availability: AvailabilityStrategy,
    /// Added to every upstream start timestamp.
    pub clock_skew: chrono::Duration,
}

#[derive(Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    metas: Vec<MetaEntry>,
}

#[derive(Deserialize)]
struct MetaEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    genres: Option<Vec<String>>,
    #[serde(default)]
    poster: Option<String>,
    #[serde(default, rename = "releaseInfo")]
    release_info: Option<String>,
    #[serde(default, alias = "startsAt")]
    starts_at: Option<i64>,
}

/// Parse a catalog reply (`{"metas": [...]}`) into items with availability resolved.
pub fn parse_catalog(json: &str, profile: &SourceProfile, now: DateTime<Utc>) -> Result<Vec<CatalogItem>, ExtractError> {
    let response: CatalogResponse =
        serde_json::from_str(json).map_err(|e| ExtractError::StructuralParse(format!("catalog: {e}")))?;

    let items = response
        .metas
        .into_iter()
        .filter_map(|meta| {
            if meta.id.is_empty() {
                debug!(name = ?meta.name, "catalog entry without id, skipping");
                return None;
            }
            let starts_at = meta
                .starts_at
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|start| start + profile.clock_skew);
            let release_info = meta.release_info.unwrap_or_default();
            let availability_state = profile.availability.classify(&release_info, starts_at, now);

            Some(CatalogItem {
                id: meta.id,
                name: meta.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| "Unknown".to_string()),
                genres: meta.genres.unwrap_or_default(),
                poster_url: meta.poster.unwrap_or_default(),
                release_info,
                starts_at,
                availability_state,
            })
        })
        .collect();

    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLink {
    pub url: String,
    pub title: Option<String>,
}

#[derive(Deserialize)]
struct StreamsResponse {
    #[serde(default)]
    streams: Vec<StreamEntry>,
}

#[derive(Deserialize)]
struct StreamEntry {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Parse a per-item stream reply (`{"streams": [...]}`), dropping entries without a URL.
pub fn parse_streams(json: &str) -> Result<Vec<StreamLink>, ExtractError> {
    let response: StreamsResponse =
        serde_json::from_str(json).map_err(|e| ExtractError::StructuralParse(format!("streams: {e}")))?;

    Ok(response
        .streams
        .into_iter()
        .filter_map(|s| {
            let url = s.url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty())?;
            Some(StreamLink {
                url,
                title: s.title.filter(|t| !t.trim().is_empty()),
            })
        })
        .collect())
}

/// Decode one base64 payload into UTF-8 text.
pub fn decode_payload(payload: &str) -> Result<String, DecodeError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(DecodeError::Base64("empty payload".to_string()));
    }
    let bytes = STANDARD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| DecodeError::Utf8(e.to_string()))
}

/// Decoded text of every `atob(...)` payload, in page order. Bad payloads are logged and skipped.
fn decoded_payloads(page: &str) -> impl Iterator<Item = String> + '_ {
    ATOB_CALL.captures_iter(page).filter_map(|caps| {
        let payload = caps.get(1).or_else(|| caps.get(2))?;
        match decode_payload(payload.as_str()) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "undecodable atob payload");
                None
            }
        }
    })
}

/// First `atob(...)` payload in the page that decodes to UTF-8 text.
pub fn deobfuscate(page: &str) -> Option<String> {
    decoded_payloads(page).next()
}

/// First decoded payload that is an absolute http(s) URL.
///
/// Players often decode config strings or tokens before the stream address.
pub fn deobfuscate_media_url(page: &str) -> Option<String> {
    decoded_payloads(page)
        .map(|text| text.trim().to_string())
        .find(|text| {
            let usable = is_http_url(text);
            if !usable {
                debug!(payload = %text, "decoded payload is not a URL, trying next");
            }
            usable
        })
}

fn is_http_url(text: &str) -> bool {
    url::Url::parse(text).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Wrap a media URL so playback goes through a referer-satisfying proxy.
pub fn proxy_url(base: &str, media_url: &str, referer: &str) -> String {
    format!(
        "{base}?u={}&ref={}&rw=1",
        urlencoding::encode(media_url),
        urlencoding::encode(referer)
    )
}

/// File extensions served as media rather than as player pages.
const MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".ts", ".m4s", ".mkv", ".webm", ".flv", ".aac", ".mp3"];

/// True when the URL already points at playable media rather than an embed page.
fn is_direct_media(link: &str) -> bool {
    let Ok(parsed) = url::Url::parse(link) else {
        return false;
    };
    let path = parsed.path().to_ascii_lowercase();
    let query = parsed.query().unwrap_or_default().to_ascii_lowercase();
    path.contains(".m3u8")
        || path.contains(".mpd")
        || MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || query.contains("m3u8")
}

/// True when a fetched "embed" body is actually an HLS playlist.
fn is_playlist_body(body: &str) -> bool {
    body.trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub base: String,
    pub referer: String,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub stream_base_url: String,
    pub categories: Vec<String>,
    pub throttle: Duration,
    pub resolve_embeds: bool,
    pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Default)]
pub struct ResolveReport {
    pub streams: Vec<ResolvedStream>,
    /// Items whose stream lookup was attempted.
    pub attempted: usize,
    /// Items outside the category allow-list.
    pub skipped: usize,
    /// Items or streams dropped after a fetch, parse or decode failure.
    pub dropped: usize,
}

pub struct Resolver {
    settings: ResolverSettings,
}

impl Resolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self { settings }
    }

    fn stream_url(&self, item_id: &str) -> String {
        format!("{}/{}.json", self.settings.stream_base_url, urlencoding::encode(item_id))
    }

    /// Look up playable streams for every allow-listed item, one request at a time.
    pub async fn resolve(&self, fetcher: &Fetcher, items: &[CatalogItem]) -> ResolveReport {
        let mut report = ResolveReport::default();

        for item in items {
            let category = item.category();
            if !self.settings.categories.iter().any(|c| c == category) {
                debug!(item = %item.name, category = %category, "category not wanted, skipping");
                report.skipped += 1;
                continue;
            }

            if report.attempted > 0 && !self.settings.throttle.is_zero() {
                tokio::time::sleep(self.settings.throttle).await;
            }
            report.attempted += 1;

            info!(
                item = %item.name,
                category = %category,
                release_info = %item.release_info,
                "processing catalog item"
            );

            let links = match self.fetch_links(fetcher, item).await {
                Some(links) if !links.is_empty() => links,
                Some(_) => {
                    warn!(item = %item.name, "no streams found");
                    report.dropped += 1;
                    continue;
                }
                None => {
                    report.dropped += 1;
                    continue;
                }
            };

            for link in links {
                match self.resolve_link(fetcher, &link).await {
                    Some(media_url) => {
                        debug!(item = %item.name, title = ?link.title, "stream added");
                        report.streams.push(ResolvedStream {
                            item: item.clone(),
                            title: link.title,
                            media_url,
                        });
                    }
                    None => report.dropped += 1,
                }
            }
        }

        info!(
            streams = report.streams.len(),
            attempted = report.attempted,
            skipped = report.skipped,
            dropped = report.dropped,
            "catalog resolved"
        );
        report
    }

    async fn fetch_links(&self, fetcher: &Fetcher, item: &CatalogItem) -> Option<Vec<StreamLink>> {
        let url = self.stream_url(&item.id);
        let fetched = match fetcher.fetch(&url, MIN_JSON_SIZE).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(item = %item.name, error = %e, "stream lookup failed");
                return None;
            }
        };
        match parse_streams(&fetched.body) {
            Ok(links) => Some(links),
            Err(e) => {
                warn!(item = %item.name, error = %e, "stream reply unreadable");
                None
            }
        }
    }

    async fn resolve_link(&self, fetcher: &Fetcher, link: &StreamLink) -> Option<String> {
        let media_url = if is_direct_media(&link.url) || !self.settings.resolve_embeds {
            link.url.clone()
        } else {
            let page = match fetcher.fetch(&link.url, MIN_EMBED_SIZE).await {
                Ok(fetched) => fetched.body,
                Err(e) => {
                    warn!(url = %link.url, error = %e, "embed page fetch failed");
                    return None;
                }
            };
            if is_playlist_body(&page) {
                debug!(url = %link.url, "link serves a playlist directly");
                link.url.clone()
            } else if let Some(url) = deobfuscate_media_url(&page) {
                url
            } else {
                warn!(url = %link.url, "no media URL found in embed page");
                return None;
            }
        };

        Some(match &self.settings.proxy {
            Some(proxy) => proxy_url(&proxy.base, &media_url, &proxy.referer),
            None => media_url,
        })
    }
}
