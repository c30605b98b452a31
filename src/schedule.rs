use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ExtractError;
use crate::models::{CategoryMap, Channel, Event, ScheduleDocument, UNKNOWN_EVENT};

/// Turns a fetched page into a schedule document. Implementations must be pure.
pub trait Extractor {
    fn extract(&self, html: &str) -> ScheduleDocument;
}

/// CSS selectors and link patterns describing one revision of the schedule markup.
///
/// Every selector is evaluated relative to the element matched by the level above it,
/// so a markup change upstream only needs a new table, not new code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SelectorTable {
    pub version: String,
    pub container: String,
    pub day: String,
    pub day_title: String,
    pub category: String,
    pub category_header: String,
    pub category_body: String,
    pub event: String,
    pub event_header: String,
    pub time: String,
    pub title: String,
    pub channels: String,
    pub channel_link: String,
    /// Regex an anchor's href must contain to count as a watch link.
    pub watch_link: String,
    /// Regex whose first group is the numeric channel id.
    pub channel_id: String,
    /// Regex removed from the end of channel labels.
    pub channel_suffix: String,
}

impl SelectorTable {
    pub fn dlhd_v1() -> Self {
        Self {
            version: "dlhd-v1".to_string(),
            container: "div#schedule".to_string(),
            day: "div.schedule__day".to_string(),
            day_title: "div.schedule__dayTitle".to_string(),
            category: "div.schedule__category".to_string(),
            category_header: "div.schedule__catHeader".to_string(),
            category_body: "div.schedule__categoryBody".to_string(),
            event: "div.schedule__event".to_string(),
            event_header: "div.schedule__eventHeader".to_string(),
            time: "span.schedule__time".to_string(),
            title: "span.schedule__eventTitle".to_string(),
            channels: "div.schedule__channels".to_string(),
            channel_link: "a[href]".to_string(),
            // Single level of escaping: the pattern must match the literal "/watch.php?id=123".
            watch_link: r"/watch\.php\?id=\d+".to_string(),
            channel_id: r"id=(\d+)".to_string(),
            channel_suffix: r"\s*CH-\d+$".to_string(),
        }
    }
}

impl Default for SelectorTable {
    fn default() -> Self {
        Self::dlhd_v1()
    }
}

/// Selector table compiled once and reused for every page.
#[derive(Debug)]
pub struct ScheduleExtractor {
    version: String,
    container: Selector,
    day: Selector,
    day_title: Selector,
    category: Selector,
    category_header: Selector,
    category_body: Selector,
    event: Selector,
    event_header: Selector,
    time: Selector,
    title: Selector,
    channels: Selector,
    channel_link: Selector,
    watch_link: Regex,
    channel_id: Regex,
    channel_suffix: Regex,
}

fn selector(field: &'static str, css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::InvalidTable {
        field,
        value: css.to_string(),
        message: format!("{e:?}"),
    })
}

fn pattern(field: &'static str, re: &str) -> Result<Regex, ExtractError> {
    Regex::new(re).map_err(|e| ExtractError::InvalidTable {
        field,
        value: re.to_string(),
        message: e.to_string(),
    })
}

impl ScheduleExtractor {
    pub fn new(table: &SelectorTable) -> Result<Self, ExtractError> {
        Ok(Self {
            version: table.version.clone(),
            container: selector("container", &table.container)?,
            day: selector("day", &table.day)?,
            day_title: selector("day_title", &table.day_title)?,
            category: selector("category", &table.category)?,
            category_header: selector("category_header", &table.category_header)?,
            category_body: selector("category_body", &table.category_body)?,
            event: selector("event", &table.event)?,
            event_header: selector("event_header", &table.event_header)?,
            time: selector("time", &table.time)?,
            title: selector("title", &table.title)?,
            channels: selector("channels", &table.channels)?,
            channel_link: selector("channel_link", &table.channel_link)?,
            watch_link: pattern("watch_link", &table.watch_link)?,
            channel_id: pattern("channel_id", &table.channel_id)?,
            channel_suffix: pattern("channel_suffix", &table.channel_suffix)?,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn extract_categories(&self, day: ElementRef) -> CategoryMap {
        let mut categories = CategoryMap::new();
        for category in day.select(&self.category) {
            let Some(header) = category.select(&self.category_header).next() else {
                debug!("category without header, skipping");
                continue;
            };
            let label = text_of(header);

            let events = match category.select(&self.category_body).next() {
                Some(body) => body.select(&self.event).filter_map(|e| self.extract_event(e)).collect(),
                None => Vec::new(),
            };
            categories.insert(label, events);
        }
        categories
    }

    fn extract_event(&self, event: ElementRef) -> Option<Event> {
        let header = event.select(&self.event_header).next()?;
        let time = header.select(&self.time).next().map(text_of).unwrap_or_default();
        let title = header
            .select(&self.title)
            .next()
            .map(text_of)
            .unwrap_or_else(|| UNKNOWN_EVENT.to_string());

        let channels = match event.select(&self.channels).next() {
            Some(list) => list.select(&self.channel_link).filter_map(|a| self.extract_channel(a)).collect(),
            None => Vec::new(),
        };

        Some(Event { time, title, channels })
    }

    fn extract_channel(&self, anchor: ElementRef) -> Option<Channel> {
        let href = anchor.value().attr("href")?;
        if !self.watch_link.is_match(href) {
            return None;
        }

        let id = self.channel_id.captures(href)?.get(1)?.as_str();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            debug!(href = %href, "watch link without numeric id, skipping");
            return None;
        }

        let label = text_of(anchor);
        let name = self.channel_suffix.replace(&label, "").trim().to_string();
        Some(Channel {
            name,
            id: id.to_string(),
        })
    }
}

impl Extractor for ScheduleExtractor {
    fn extract(&self, html: &str) -> ScheduleDocument {
        let page = Html::parse_document(html);
        let mut document = ScheduleDocument::new();

        let Some(root) = page.select(&self.container).next() else {
            warn!(version = %self.version, "schedule container not found in page");
            return document;
        };

        for day in root.select(&self.day) {
            let Some(title) = day.select(&self.day_title).next() else {
                debug!("day section without title, skipping");
                continue;
            };
            document.insert(text_of(title), self.extract_categories(day));
        }

        debug!(version = %self.version, days = document.len(), "schedule extracted");
        document
    }
}

fn text_of(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}
