use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{PlaylistEntry, ResolvedStream, ScheduleDocument};

pub const PLAYLIST_HEADER: &str = "#EXTM3U";

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Which time goes in the trailing `[...]` of a display name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampStrategy {
    /// When this playlist was generated.
    #[default]
    RunTime,
    /// The event's start time, falling back to the run time when unknown.
    StartTime,
}

/// `[STATUS] name - title [timestamp]`, omitting the parts that don't apply.
pub fn display_name(stream: &ResolvedStream, stamp: &str) -> String {
    let item = &stream.item;
    let mut name = String::new();

    let tag = item.availability_state.tag();
    if !tag.is_empty() {
        name.push_str(tag);
        name.push(' ');
    }
    name.push_str(&item.name);

    if let Some(title) = stream.title.as_deref().filter(|t| *t != item.name) {
        name.push_str(" - ");
        name.push_str(title);
    }

    name.push_str(" [");
    name.push_str(stamp);
    name.push(']');
    name
}

pub fn build_entries(streams: &[ResolvedStream], strategy: TimestampStrategy, now: DateTime<Utc>) -> Vec<PlaylistEntry> {
    let run_stamp = now.format(STAMP_FORMAT).to_string();

    streams
        .iter()
        .map(|stream| {
            let stamp = match (strategy, stream.item.starts_at) {
                (TimestampStrategy::StartTime, Some(start)) => start.format(STAMP_FORMAT).to_string(),
                _ => run_stamp.clone(),
            };
            PlaylistEntry {
                display_name: display_name(stream, &stamp),
                group: stream.item.category().to_string(),
                tvg_id: stream.item.name.clone(),
                logo_url: stream.item.poster_url.clone(),
                media_url: stream.media_url.clone(),
            }
        })
        .collect()
}

/// Keep attribute values on one line and inside their quotes.
fn attr(value: &str) -> String {
    value.replace('"', "'").replace(['\r', '\n'], " ")
}

pub fn render_playlist(entries: &[PlaylistEntry]) -> String {
    let mut lines = Vec::with_capacity(entries.len() * 2 + 1);
    lines.push(PLAYLIST_HEADER.to_string());

    for entry in entries {
        let name = attr(&entry.display_name);
        lines.push(format!(
            "#EXTINF:-1 tvg-logo=\"{logo}\" group-title=\"{group}\" tvg-id=\"{id}\" tvg-name=\"{name}\",{name}",
            logo = attr(&entry.logo_url),
            group = attr(&entry.group),
            id = attr(&entry.tvg_id),
        ));
        lines.push(entry.media_url.trim().to_string());
    }

    lines.join("\n")
}

/// Pretty JSON with four-space indentation, keys in document order.
pub fn render_schedule(doc: &ScheduleDocument) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    doc.serialize(&mut serializer)?;
    // serde_json only ever writes valid UTF-8.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn parse_schedule(text: &str) -> Result<ScheduleDocument, serde_json::Error> {
    serde_json::from_str(text)
}
