use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::catalog::{self, Resolver};
use crate::config::{CatalogConfig, ScheduleConfig};
use crate::fetch::Fetcher;
use crate::playlist;
use crate::schedule::Extractor;

/// Result of one independent pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl StageOutcome {
    fn from_result(stage: &'static str, result: Result<String>) -> Self {
        match result {
            Ok(detail) => {
                info!(stage, detail = %detail, "stage finished");
                Self { stage, ok: true, detail }
            }
            Err(e) => {
                warn!(stage, error = %format!("{e:#}"), "stage failed");
                Self {
                    stage,
                    ok: false,
                    detail: format!("{e:#}"),
                }
            }
        }
    }
}

/// Fetch the schedule page, extract it, and write the JSON document.
///
/// An empty extraction counts as a failure and leaves the previous output untouched.
pub async fn run_schedule(config: &ScheduleConfig, fetcher: &Fetcher, extractor: &dyn Extractor) -> StageOutcome {
    StageOutcome::from_result("schedule", schedule_stage(config, fetcher, extractor).await)
}

async fn schedule_stage(config: &ScheduleConfig, fetcher: &Fetcher, extractor: &dyn Extractor) -> Result<String> {
    info!(url = %config.url, "fetching schedule page");
    let page = fetcher.fetch(&config.url, config.min_size).await?;

    let doc = extractor.extract(&page.body);
    if doc.is_empty() {
        anyhow::bail!("no schedule days found in page ({} bytes)", page.body.len());
    }

    for (day, categories) in doc.iter() {
        debug!(day = %day, categories = ?categories.keys().collect::<Vec<_>>(), "day extracted");
    }
    let events: usize = doc.values().flat_map(|cats| cats.values()).map(Vec::len).sum();
    let json = playlist::render_schedule(&doc).context("serializing schedule")?;
    write_output(&config.output, &json).await?;

    Ok(format!(
        "{} days, {} events written to {} after {} attempt(s) via {}",
        doc.len(),
        events,
        config.output,
        page.attempts,
        page.via.as_str()
    ))
}

/// Fetch the 24/7 channel listing and save its raw HTML. `None` when no URL is configured.
pub async fn run_channels_page(config: &ScheduleConfig, fetcher: &Fetcher) -> Option<StageOutcome> {
    let url = config.channels_url.as_deref().filter(|u| !u.is_empty())?;
    Some(StageOutcome::from_result("channels", channels_stage(config, url, fetcher).await))
}

async fn channels_stage(config: &ScheduleConfig, url: &str, fetcher: &Fetcher) -> Result<String> {
    info!(url = %url, "fetching 24/7 channels page");
    let page = fetcher.fetch(url, config.channels_min_size).await?;
    write_output(&config.channels_output, &page.body).await?;
    Ok(format!("{} bytes written to {}", page.body.len(), config.channels_output))
}

/// Fetch the catalog, resolve streams for wanted items, and write the M3U playlist.
pub async fn run_catalog(config: &CatalogConfig, fetcher: &Fetcher, now: DateTime<Utc>) -> StageOutcome {
    StageOutcome::from_result("catalog", catalog_stage(config, fetcher, now).await)
}

async fn catalog_stage(config: &CatalogConfig, fetcher: &Fetcher, now: DateTime<Utc>) -> Result<String> {
    let profile = config.profile()?;
    let settings = config.resolver_settings()?;

    info!(url = %config.catalog_url, "fetching catalog");
    let page = fetcher.fetch(&config.catalog_url, catalog::MIN_JSON_SIZE).await?;
    let items = catalog::parse_catalog(&page.body, &profile, now)?;
    if items.is_empty() {
        anyhow::bail!("catalog has no items");
    }
    info!(items = items.len(), "catalog parsed");

    let report = Resolver::new(settings).resolve(fetcher, &items).await;
    let entries = playlist::build_entries(&report.streams, config.timestamp, now);
    write_output(&config.output, &playlist::render_playlist(&entries)).await?;

    Ok(format!(
        "{} streams written to {} ({} items processed, {} skipped, {} dropped)",
        entries.len(),
        config.output,
        report.attempted,
        report.skipped,
        report.dropped
    ))
}

async fn write_output(path: &str, content: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("writing {path}"))?;
    info!(path = %path, bytes = content.len(), "output written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use chrono::TimeZone;

    use super::*;
    use crate::fetch::FetchMode;
    use crate::fetch::testing::{ScriptedTransport, policy};
    use crate::playlist::{PLAYLIST_HEADER, parse_schedule};
    use crate::schedule::{ScheduleExtractor, SelectorTable};

    const SCHEDULE_PAGE: &str = r#"<html><body><div id="schedule">
        <div class="schedule__day">
          <div class="schedule__dayTitle">Saturday 01 March 2025</div>
          <div class="schedule__category">
            <div class="schedule__catHeader">Soccer</div>
            <div class="schedule__categoryBody">
              <div class="schedule__event">
                <div class="schedule__eventHeader">
                  <span class="schedule__time">15:00</span>
                  <span class="schedule__eventTitle">Leeds vs Burnley</span>
                </div>
                <div class="schedule__channels"><a href="/watch.php?id=35">Sky Sports Football CH-35</a></div>
              </div>
            </div>
          </div>
        </div>
    </div></body></html>"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn schedule_config(dir: &Path) -> ScheduleConfig {
        ScheduleConfig {
            url: "https://dlhd.example/".to_string(),
            output: dir.join("schedule.json").display().to_string(),
            min_size: 100,
            channels_url: Some("https://dlhd.example/24-7-channels.php".to_string()),
            channels_output: dir.join("247.html").display().to_string(),
            channels_min_size: 50,
            ..ScheduleConfig::default()
        }
    }

    #[tokio::test]
    async fn schedule_stage_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = schedule_config(dir.path());
        let transport = ScriptedTransport::default()
            .reply(&config.url, "<html>checking your browser</html>")
            .reply(&config.url, SCHEDULE_PAGE);
        let fetcher = Fetcher::new(Box::new(transport), None, policy(3, FetchMode::Direct));
        let extractor = ScheduleExtractor::new(&SelectorTable::default()).unwrap();

        let outcome = run_schedule(&config, &fetcher, &extractor).await;
        assert!(outcome.ok, "{}", outcome.detail);
        assert!(outcome.detail.contains("2 attempt(s)"));

        let written = std::fs::read_to_string(&config.output).unwrap();
        let doc = parse_schedule(&written).unwrap();
        let events = doc.get("Saturday 01 March 2025").unwrap().get("Soccer").unwrap();
        assert_eq!(events[0].channels[0].name, "Sky Sports Football");
        assert_eq!(events[0].channels[0].id, "35");
    }

    #[tokio::test]
    async fn empty_schedule_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = schedule_config(dir.path());
        std::fs::write(&config.output, "{\"previous\": {}}").unwrap();

        let page = format!("<html><body>{}</body></html>", "<p>maintenance</p>".repeat(20));
        let transport = ScriptedTransport::default().reply(&config.url, &page);
        let fetcher = Fetcher::new(Box::new(transport), None, policy(1, FetchMode::Direct));
        let extractor = ScheduleExtractor::new(&SelectorTable::default()).unwrap();

        let outcome = run_schedule(&config, &fetcher, &extractor).await;
        assert!(!outcome.ok);
        assert_eq!(std::fs::read_to_string(&config.output).unwrap(), "{\"previous\": {}}");
    }

    #[tokio::test]
    async fn channels_page_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = schedule_config(dir.path());
        let fetcher = Fetcher::new(Box::new(ScriptedTransport::default()), None, policy(2, FetchMode::Direct));

        let outcome = run_channels_page(&config, &fetcher).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.detail.contains("2 attempt(s)"));

        let without_url = ScheduleConfig {
            channels_url: None,
            ..schedule_config(dir.path())
        };
        assert!(run_channels_page(&without_url, &fetcher).await.is_none());
    }

    #[tokio::test]
    async fn catalog_stage_writes_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let config = CatalogConfig {
            catalog_url: "https://addon.example/catalog.json".to_string(),
            stream_base_url: "https://addon.example/stream".to_string(),
            output: path_in(&dir, "out/ppv.m3u"),
            categories: vec!["Football".to_string()],
            throttle: "0s".to_string(),
            ..CatalogConfig::default()
        };
        let embed = format!(
            "<html><script>var s = atob(\"{}\");</script><div>player container</div></html>",
            base64::engine::general_purpose::STANDARD.encode("https://edge.example/live.m3u8")
        );
        let transport = ScriptedTransport::default()
            .reply(
                &config.catalog_url,
                r#"{"metas":[
                    {"id":"f1","name":"Derby","genres":["Football"],"poster":"https://img.example/f1.png","releaseInfo":"Live"},
                    {"id":"c1","name":"Bake Off","genres":["Cooking"],"releaseInfo":"Upcoming"}
                ]}"#,
            )
            .reply(
                "https://addon.example/stream/f1.json",
                r#"{"streams":[{"url":"https://embed.example/e/f1","title":"Feed 1"}]}"#,
            )
            .reply("https://embed.example/e/f1", &embed);
        let fetcher = Fetcher::new(Box::new(transport), None, policy(1, FetchMode::Direct));

        let outcome = run_catalog(&config, &fetcher, now()).await;
        assert!(outcome.ok, "{}", outcome.detail);
        assert!(outcome.detail.contains("1 skipped"));

        let written = std::fs::read_to_string(&config.output).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines[0], PLAYLIST_HEADER);
        assert!(lines[1].contains("group-title=\"Football\""));
        assert!(lines[1].ends_with(",[LIVE] Derby - Feed 1 [2025-03-01 12:00]"));
        assert_eq!(lines[2], "https://edge.example/live.m3u8");
    }

    #[tokio::test]
    async fn catalog_fetch_failure_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = CatalogConfig {
            output: path_in(&dir, "ppv.m3u"),
            ..CatalogConfig::default()
        };
        let fetcher = Fetcher::new(Box::new(ScriptedTransport::default()), None, policy(1, FetchMode::Direct));

        let outcome = run_catalog(&config, &fetcher, now()).await;
        assert!(!outcome.ok);
        assert!(!Path::new(&config.output).exists());
    }

    fn path_in(dir: &tempfile::TempDir, rel: &str) -> String {
        dir.path().join(rel).display().to_string()
    }
}
