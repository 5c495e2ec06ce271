// Value types exchanged between consumers, the wire and publishers.
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::time::Duration;

/// Starts at the first event of a partition.
pub const FIRST_CURSOR: &str = "_first";
/// Starts near the most recent event of a partition.
pub const LAST_CURSOR: &str = "_last";
/// Headers selector asking for every header the publisher has.
pub const ALL_HEADERS: &str = "_all";
/// Token handed out for feeds that only speak the legacy protocol.
pub const LEGACY_TOKEN: &str = "_v1";
/// Page size hint meaning "let the publisher choose".
pub const DEFAULT_PAGE_SIZE: usize = 0;

pub type Headers = BTreeMap<String, String>;

/// Wire dialect spoken for one fetch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dialect {
    /// Single endpoint, `n` handshake, `cursor<N>` parameters, records carry `partition`.
    Legacy,
    /// Discovery document plus `/events`, one partition per call.
    Current,
}

impl Dialect {
    pub fn for_token(token: &str) -> Self {
        if token == LEGACY_TOKEN {
            Dialect::Legacy
        } else {
            Dialect::Current
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "partition")]
    pub partition_id: i64,
    pub cursor: String,
}

impl Cursor {
    pub fn new(partition_id: i64, cursor: impl Into<String>) -> Self {
        Self {
            partition_id,
            cursor: cursor.into(),
        }
    }

    pub fn first(partition_id: i64) -> Self {
        Self::new(partition_id, FIRST_CURSOR)
    }

    pub fn last(partition_id: i64) -> Self {
        Self::new(partition_id, LAST_CURSOR)
    }

    pub fn is_first(&self) -> bool {
        self.cursor == FIRST_CURSOR
    }

    pub fn is_last(&self) -> bool {
        self.cursor == LAST_CURSOR
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Partition {
    pub id: i64,
    pub closed: bool,
    pub starts_after_partition: i64,
    pub cursor_from_partitions: Vec<i64>,
}

impl Partition {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedInfo {
    pub token: String,
    pub partitions: Vec<Partition>,
    pub exactly_once: bool,
}

impl FeedInfo {
    /// Discovery answer synthesized for a feed that predates discovery.
    pub fn legacy(partition_count: usize) -> Self {
        Self {
            token: LEGACY_TOKEN.to_string(),
            partitions: (0..partition_count as i64).map(Partition::new).collect(),
            exactly_once: false,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.token == LEGACY_TOKEN
    }

    pub fn partition(&self, id: i64) -> Option<&Partition> {
        self.partitions.iter().find(|partition| partition.id == id)
    }
}

/// One event as carried on the wire; `data` stays undecoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "partition")]
    pub partition_id: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Headers,
    pub data: Box<RawValue>,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.partition_id == other.partition_id
            && self.headers == other.headers
            && self.data.get() == other.data.get()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedEnvelope<T> {
    #[serde(rename = "partition")]
    pub partition_id: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Headers,
    pub data: T,
}

/// Per-call fetch options. Zero values mean "not requested".
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Options {
    pub page_size_hint: usize,
    pub headers: Option<Vec<String>>,
    /// Long-poll: how long the publisher may wait for new events.
    pub wait: Duration,
    /// Streaming: how long the publisher may keep emitting; lines are flushed as written.
    pub stream: Duration,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size_hint(mut self, page_size_hint: usize) -> Self {
        self.page_size_hint = page_size_hint;
        self
    }

    pub fn with_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers = Some(headers.into_iter().map(Into::into).collect());
        self
    }

    pub fn all_headers(self) -> Self {
        self.with_headers([ALL_HEADERS])
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_stream(mut self, stream: Duration) -> Self {
        self.stream = stream;
        self
    }

    /// Whether a publisher should attach header `name` to emitted events.
    pub fn selects_header(&self, name: &str) -> bool {
        self.headers
            .as_ref()
            .is_some_and(|headers| headers.iter().any(|h| h == ALL_HEADERS || h == name))
    }
}
