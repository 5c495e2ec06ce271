//! Purpose: Shared fixtures for the HTTP integration tests.
//! Exports: `TestServer`, `FixturePublisher`, `TestEvent`, `TestResult`.
//! Role: Runs feeds in-process on a loopback port so client and server meet over real TCP.
//! Invariants: Each server binds its own ephemeral port before the test talks to it.
//! Invariants: Servers stop accepting requests when dropped.
#![allow(dead_code)]

use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;

use zeroeventhub::api::{
    Client, Cursor, DEFAULT_PAGE_SIZE, Error, ErrorKind, EventPublisher, EventReceiver,
    FIRST_CURSOR, FeedInfo, Headers, HttpHandlers, LAST_CURSOR, Options, Partition,
};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

pub const TOKEN: &str = "the-token";
pub const FEED_PATH: &str = "/feed/v1";
pub const EVENTS_PER_PARTITION: i64 = 10_000;
pub const FIXTURE_PAGE_SIZE: usize = 100;
pub const CURSOR_RETURN_500: &str = "returnHttp500";
pub const CURSOR_RETURN_504: &str = "returnHttp504";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Version")]
    pub version: i64,
    #[serde(rename = "Cursor")]
    pub cursor: i64,
}

impl TestEvent {
    pub fn new(partition_id: i64, cursor: i64) -> Self {
        let prefix = if partition_id == 0 {
            "00000000"
        } else {
            "11111111"
        };
        Self {
            id: format!("{prefix}-0000-0000-0000-{cursor:012x}"),
            version: 0,
            cursor,
        }
    }
}

/// Two partitions of 10000 events each; cursors are the event positions.
pub struct FixturePublisher {
    feed_info: FeedInfo,
    partitions: BTreeMap<i64, Vec<TestEvent>>,
}

impl FixturePublisher {
    pub fn new() -> Self {
        let partitions = [0, 1]
            .into_iter()
            .map(|partition_id| {
                let events = (0..EVENTS_PER_PARTITION)
                    .map(|cursor| TestEvent::new(partition_id, cursor))
                    .collect();
                (partition_id, events)
            })
            .collect();
        Self {
            feed_info: FeedInfo {
                token: TOKEN.to_string(),
                partitions: vec![Partition::new(0), Partition::new(1)],
                exactly_once: false,
            },
            partitions,
        }
    }

    pub fn with_feed_info(mut self, feed_info: FeedInfo) -> Self {
        self.feed_info = feed_info;
        self
    }
}

impl EventPublisher for FixturePublisher {
    fn name(&self) -> &str {
        "fixture"
    }

    fn feed_info(&self) -> FeedInfo {
        self.feed_info.clone()
    }

    fn fetch_events(
        &self,
        cursor: &Cursor,
        receiver: &mut dyn EventReceiver,
        options: &Options,
    ) -> Result<(), Error> {
        let page_size = match options.page_size_hint {
            DEFAULT_PAGE_SIZE => FIXTURE_PAGE_SIZE,
            hint => hint,
        };
        let Some(events) = self.partitions.get(&cursor.partition_id) else {
            return Err(Error::partition_not_found(cursor.partition_id));
        };
        let mut last_processed = match cursor.cursor.as_str() {
            FIRST_CURSOR => -100,
            LAST_CURSOR => events.len() as i64 - 2,
            CURSOR_RETURN_500 => return Err(Error::mock_internal("error when fetching events")),
            CURSOR_RETURN_504 => return Err(Error::mock_gateway_timeout()),
            other => other.parse().map_err(|err: std::num::ParseIntError| {
                Error::new(ErrorKind::Publisher)
                    .with_message(format!("unparsable cursor {other:?}"))
                    .with_source(err)
            })?,
        };

        let mut headers = Headers::new();
        if options.selects_header("content-type") {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        if options.selects_header("foo") {
            headers.insert("foo".to_string(), "bar".to_string());
        }

        let mut processed = 0;
        for event in events {
            if processed == page_size {
                break;
            }
            if event.cursor <= last_processed {
                continue;
            }
            let data = serde_json::to_string(event)
                .and_then(RawValue::from_string)
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to encode fixture event")
                        .with_source(err)
                })?;
            receiver.on_event(cursor.partition_id, headers.clone(), data)?;
            receiver.on_checkpoint(cursor.partition_id, event.cursor.to_string())?;
            last_processed = event.cursor;
            processed += 1;
        }
        Ok(())
    }
}

/// What a `ScriptedPublisher` does after emitting its events.
#[derive(Clone, Copy, Debug)]
pub enum AfterEvents {
    Stall(Duration),
    Fail,
    Panic,
}

/// Emits the first `events` fixture events of the partition, then follows `then`.
pub struct ScriptedPublisher {
    fixture: FixturePublisher,
    events: usize,
    then: AfterEvents,
}

impl ScriptedPublisher {
    pub fn new(events: usize, then: AfterEvents) -> Self {
        Self {
            fixture: FixturePublisher::new(),
            events,
            then,
        }
    }
}

impl EventPublisher for ScriptedPublisher {
    fn name(&self) -> &str {
        "scripted"
    }

    fn feed_info(&self) -> FeedInfo {
        self.fixture.feed_info()
    }

    fn fetch_events(
        &self,
        cursor: &Cursor,
        receiver: &mut dyn EventReceiver,
        options: &Options,
    ) -> Result<(), Error> {
        if self.events > 0 {
            self.fixture.fetch_events(
                &Cursor::first(cursor.partition_id),
                receiver,
                &options.clone().with_page_size_hint(self.events),
            )?;
        }
        match self.then {
            AfterEvents::Stall(duration) => {
                std::thread::sleep(duration);
                Ok(())
            }
            AfterEvents::Fail => {
                Err(Error::new(ErrorKind::Publisher).with_message("event store went away"))
            }
            AfterEvents::Panic => panic!("event store is corrupt"),
        }
    }
}

/// Axum app served from a dedicated runtime thread.
pub struct TestServer {
    pub base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn start(router: Router) -> TestResult<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        std::thread::spawn(move || {
            runtime.block_on(async move {
                let listener =
                    tokio::net::TcpListener::from_std(listener).expect("adopt test listener");
                let _ = axum::serve(listener, router)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
            });
        });
        Ok(Self {
            base_url: format!("http://{addr}"),
            shutdown: Some(shutdown_tx),
        })
    }

    /// Fixture feed with discovery at `FEED_PATH` and events at `FEED_PATH/events`.
    pub fn fixture() -> TestResult<Self> {
        Self::start(HttpHandlers::new(FixturePublisher::new()).router(FEED_PATH))
    }

    pub fn scripted(events: usize, then: AfterEvents) -> TestResult<Self> {
        Self::start(HttpHandlers::new(ScriptedPublisher::new(events, then)).router(FEED_PATH))
    }

    /// Fixture feed that only speaks the legacy dialect at `FEED_PATH`.
    pub fn legacy_fixture() -> TestResult<Self> {
        let handlers = HttpHandlers::new(FixturePublisher::new());
        Self::start(Router::new().route(FEED_PATH, handlers.legacy_route()))
    }

    pub fn feed_url(&self) -> String {
        format!("{}{FEED_PATH}", self.base_url)
    }

    pub fn client(&self) -> TestResult<Client> {
        Ok(Client::new(self.feed_url())?)
    }

    pub fn legacy_client(&self, partition_count: usize) -> TestResult<Client> {
        Ok(self.client()?.with_legacy_partition_count(partition_count))
    }

    /// Raw GET against the server, bypassing the feed client.
    pub fn get(&self, path_and_query: &str) -> TestResult<RawResponse> {
        let url = format!("{}{path_and_query}", self.base_url);
        let response = match ureq::get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(err.into()),
        };
        let status = response.status();
        let content_type = response.header("content-type").map(str::to_string);
        let body = response.into_string()?;
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}
