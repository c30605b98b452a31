use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Title used when an event row has no title element.
pub const UNKNOWN_EVENT: &str = "Unknown Event";

/// Category used when a catalog item carries no genres.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// String-keyed map that keeps insertion order.
///
/// Re-inserting an existing key replaces the value in its original position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(k, v)| (k, v)))
    }
}

struct OrderedMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map with string keys")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = OrderedMap::new();
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Category label → events, in page order.
pub type CategoryMap = OrderedMap<Vec<Event>>;

/// Day label → categories, in page order.
pub type ScheduleDocument = OrderedMap<CategoryMap>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: String,
    #[serde(rename = "event")]
    pub title: String,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "channel_name")]
    pub name: String,
    #[serde(rename = "channel_id")]
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Live,
    Upcoming,
    Available,
    Unknown,
}

impl AvailabilityState {
    /// Bracketed prefix for display names; empty when the state needs no tag.
    pub fn tag(self) -> &'static str {
        match self {
            AvailabilityState::Live => "[LIVE]",
            AvailabilityState::Upcoming => "[UPCOMING]",
            AvailabilityState::Available | AvailabilityState::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub poster_url: String,
    pub release_info: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub availability_state: AvailabilityState,
}

impl CatalogItem {
    /// First genre, used as the playlist group and for allow-list filtering.
    pub fn category(&self) -> &str {
        self.genres.first().map(String::as_str).unwrap_or(UNKNOWN_CATEGORY)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub item: CatalogItem,
    pub title: Option<String>,
    pub media_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub display_name: String,
    pub group: String,
    pub tvg_id: String,
    pub logo_url: String,
    pub media_url: String,
}
