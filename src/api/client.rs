//! Purpose: Blocking HTTP client for zeroeventhub feeds (legacy and current dialects).
//! Exports: `Client`, `FetchContext`, `CancelToken`.
//! Role: Builds requests, negotiates the dialect, and streams decoded records to a receiver.
//! Invariants: Response bodies are scanned line by line; nothing buffers a whole page.
//! Invariants: The first decode or receiver error aborts the scan; nothing is retried.
//! Invariants: Transport, hook and span are per-client values, never process-wide state.
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Cursor, Dialect, FeedInfo, Options};
use crate::core::ndjson::{Record, RecordReader};
use crate::core::query::{encode_current, encode_legacy};
use crate::core::receiver::EventReceiver;
use serde::de::DeserializeOwned;
use std::io::{BufReader, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::Span;
use url::Url;

type ApiResult<T> = Result<T, Error>;
type RequestHook = dyn Fn(ureq::Request) -> ApiResult<ureq::Request> + Send + Sync;

const DEFAULT_ERROR_BODY_LIMIT: usize = 1024;
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);
const RECORD_BACKLOG: usize = 256;

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Clone)]
struct ClientInner {
    base_url: Url,
    legacy_partition_count: Option<usize>,
    agent: ureq::Agent,
    request_hook: Option<Arc<RequestHook>>,
    span: Span,
    error_body_limit: usize,
}

/// Cooperative cancellation shared between a caller and an in-flight fetch.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-call deadline and cancellation.
///
/// The deadline becomes the request timeout and bounds connect, send and
/// every body read. With a cancel token the request runs on a reader thread
/// and the caller polls the token while waiting, so a cancel also ends a
/// fetch blocked on the socket.
#[derive(Clone, Debug, Default)]
pub struct FetchContext {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl FetchContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check(&self) -> ApiResult<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(fetch_cancelled());
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::new(ErrorKind::Io).with_message("fetch deadline exceeded"));
        }
        Ok(())
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

enum CallOutcome {
    Success(ureq::Response),
    Status(u16, ureq::Response),
}

impl Client {
    /// `feed_url` is the discovery endpoint; current-dialect fetches go to `<feed_url>/events`.
    pub fn new(feed_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_feed_url(feed_url.into())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                legacy_partition_count: None,
                agent: ureq::AgentBuilder::new().build(),
                request_hook: None,
                span: Span::none(),
                error_body_limit: DEFAULT_ERROR_BODY_LIMIT,
            }),
        })
    }

    /// Enables the legacy fallback: a feed that rejects discovery with 400 is
    /// treated as a legacy feed with `partition_count` partitions.
    pub fn with_legacy_partition_count(self, partition_count: usize) -> Self {
        self.update(|inner| inner.legacy_partition_count = Some(partition_count))
    }

    pub fn with_agent(self, agent: ureq::Agent) -> Self {
        self.update(|inner| inner.agent = agent)
    }

    /// Runs on every request right before it is sent (auth headers and the like).
    pub fn with_request_hook<F>(self, hook: F) -> Self
    where
        F: Fn(ureq::Request) -> ApiResult<ureq::Request> + Send + Sync + 'static,
    {
        let hook: Arc<RequestHook> = Arc::new(hook);
        self.update(|inner| inner.request_hook = Some(hook))
    }

    /// Span entered around every call; log events from this client nest under it.
    pub fn with_span(self, span: Span) -> Self {
        self.update(|inner| inner.span = span)
    }

    pub fn with_error_body_limit(self, limit: usize) -> Self {
        self.update(|inner| inner.error_body_limit = limit)
    }

    pub fn feed_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn legacy_partition_count(&self) -> Option<usize> {
        self.inner.legacy_partition_count
    }

    pub fn discover(&self, ctx: &FetchContext) -> ApiResult<FeedInfo> {
        let _entered = self.inner.span.enter();
        let url = self.inner.base_url.clone();
        match self.call(ctx, &url)? {
            CallOutcome::Success(response) => read_json_response(response),
            CallOutcome::Status(status, response) => {
                if let (400, Some(partition_count)) = (status, self.inner.legacy_partition_count)
                {
                    tracing::debug!(
                        request_url = %url,
                        partition_count,
                        "discovery rejected; assuming legacy feed"
                    );
                    return Ok(FeedInfo::legacy(partition_count));
                }
                let body = read_error_body(response.into_reader(), self.inner.error_body_limit);
                let err = Error::new(ErrorKind::Transport)
                    .with_status(status)
                    .with_message(normalize_error_body(&body));
                tracing::error!(
                    response_code = status,
                    request_url = %url,
                    error = %err,
                    "discovery failed"
                );
                Err(err)
            }
        }
    }

    /// Fetches one page of `partition_id` starting after `cursor`.
    ///
    /// The dialect follows `token`: the legacy token selects the legacy
    /// endpoint, anything else is sent to `<feed_url>/events`.
    pub fn fetch_events<R>(
        &self,
        ctx: &FetchContext,
        token: &str,
        partition_id: i64,
        cursor: &str,
        receiver: &mut R,
        options: &Options,
    ) -> ApiResult<()>
    where
        R: EventReceiver + ?Sized,
    {
        let _entered = self.inner.span.enter();
        let cursor = Cursor::new(partition_id, cursor);
        let url = match Dialect::for_token(token) {
            Dialect::Legacy => {
                let partition_count = self.require_legacy_partition_count()?;
                let mut url = self.inner.base_url.clone();
                url.query_pairs_mut()
                    .extend_pairs(encode_legacy(partition_count, &[cursor], options));
                url
            }
            Dialect::Current => {
                let mut url = events_url(&self.inner.base_url)?;
                url.query_pairs_mut()
                    .extend_pairs(encode_current(token, &cursor, options));
                url
            }
        };
        self.fetch_page(ctx, &url, partition_id, receiver)
    }

    /// Legacy fetch carrying a whole cursor set in one request.
    pub fn fetch_events_legacy<R>(
        &self,
        ctx: &FetchContext,
        cursors: &[Cursor],
        receiver: &mut R,
        options: &Options,
    ) -> ApiResult<()>
    where
        R: EventReceiver + ?Sized,
    {
        let _entered = self.inner.span.enter();
        if cursors.is_empty() {
            return Err(Error::cursors_missing());
        }
        let partition_count = self.require_legacy_partition_count()?;
        let mut url = self.inner.base_url.clone();
        url.query_pairs_mut()
            .extend_pairs(encode_legacy(partition_count, cursors, options));
        self.fetch_page(ctx, &url, cursors[0].partition_id, receiver)
    }

    fn fetch_page<R>(
        &self,
        ctx: &FetchContext,
        url: &Url,
        default_partition: i64,
        receiver: &mut R,
    ) -> ApiResult<()>
    where
        R: EventReceiver + ?Sized,
    {
        ctx.check()?;
        let records = match &ctx.cancel {
            None => self.scan_page(ctx, url, default_partition, |record| {
                record.dispatch(&mut *receiver)
            })?,
            Some(_) => self.scan_page_cancellable(ctx, url, default_partition, receiver)?,
        };
        tracing::debug!(request_url = %url, records, "page fetched");
        Ok(())
    }

    /// Runs the request on a reader thread so a cancel is noticed while the
    /// socket is blocked. The reader thread is abandoned on cancel and exits
    /// at its next read.
    fn scan_page_cancellable<R>(
        &self,
        ctx: &FetchContext,
        url: &Url,
        default_partition: i64,
        receiver: &mut R,
    ) -> ApiResult<usize>
    where
        R: EventReceiver + ?Sized,
    {
        let (tx, rx) = mpsc::sync_channel::<ApiResult<Record>>(RECORD_BACKLOG);
        let client = self.clone();
        let reader_ctx = ctx.clone();
        let reader_url = url.clone();
        thread::Builder::new()
            .name("zeroeventhub-fetch".to_string())
            .spawn(move || {
                let _entered = client.inner.span.enter();
                let send = |record| tx.send(Ok(record)).map_err(|_| fetch_cancelled());
                let result = client.scan_page(&reader_ctx, &reader_url, default_partition, send);
                if let Err(err) = result {
                    let _ = tx.send(Err(err));
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start fetch thread")
                    .with_source(err)
            })?;

        let mut records = 0usize;
        loop {
            match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(record) => {
                    ctx.check()?;
                    record?.dispatch(receiver)?;
                    records += 1;
                }
                Err(RecvTimeoutError::Timeout) => ctx.check()?,
                Err(RecvTimeoutError::Disconnected) => return Ok(records),
            }
        }
    }

    fn scan_page<F>(
        &self,
        ctx: &FetchContext,
        url: &Url,
        default_partition: i64,
        mut on_record: F,
    ) -> ApiResult<usize>
    where
        F: FnMut(Record) -> ApiResult<()>,
    {
        let response = match self.call(ctx, url)? {
            CallOutcome::Success(response) => response,
            CallOutcome::Status(status, response) => {
                let body = response.into_string().map_err(|err| {
                    tracing::error!(
                        response_code = status,
                        request_url = %url,
                        error = %err,
                        "failed to read response body"
                    );
                    Error::new(ErrorKind::Io)
                        .with_status(status)
                        .with_message("failed to read response body")
                        .with_source(err)
                })?;
                let err = Error::new(ErrorKind::Transport)
                    .with_status(status)
                    .with_message(normalize_error_body(&body));
                tracing::error!(
                    response_code = status,
                    request_url = %url,
                    error = %err,
                    "unexpected response body"
                );
                return Err(err);
            }
        };

        let reader = BufReader::new(response.into_reader());
        let mut records = 0usize;
        for record in RecordReader::new(reader).with_default_partition(default_partition) {
            ctx.check()?;
            on_record(record?)?;
            records += 1;
        }
        Ok(records)
    }

    fn call(&self, ctx: &FetchContext, url: &Url) -> ApiResult<CallOutcome> {
        ctx.check()?;
        let mut request = self
            .inner
            .agent
            .request("GET", url.as_str())
            .set("Accept", NDJSON_CONTENT_TYPE);
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }
        if let Some(hook) = &self.inner.request_hook {
            request = hook(request)?;
        }
        match request.call() {
            Ok(response) if response.status() / 100 == 2 => Ok(CallOutcome::Success(response)),
            Ok(response) => Ok(CallOutcome::Status(response.status(), response)),
            Err(ureq::Error::Status(code, response)) => Ok(CallOutcome::Status(code, response)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("request failed")
                .with_source(err)),
        }
    }

    fn require_legacy_partition_count(&self) -> ApiResult<usize> {
        self.inner.legacy_partition_count.ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("legacy feeds require a partition count on the client")
        })
    }

    fn update(mut self, apply: impl FnOnce(&mut ClientInner)) -> Self {
        apply(Arc::make_mut(&mut self.inner));
        self
    }
}

fn normalize_feed_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid feed url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(
            Error::new(ErrorKind::Usage).with_message("feed url must use http or https scheme")
        );
    }
    if url.cannot_be_a_base() {
        return Err(Error::new(ErrorKind::Usage).with_message("feed url cannot be a base"));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn events_url(base_url: &Url) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("feed url cannot be a base")
        })?;
        path.pop_if_empty().push("events");
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Decode)
            .with_message("invalid discovery document")
            .with_source(err)
    })
}

fn read_error_body(reader: impl Read, limit: usize) -> String {
    let mut bytes = Vec::new();
    if let Err(err) = reader.take(limit as u64 + 1).read_to_end(&mut bytes) {
        tracing::warn!(
            bytes_read = bytes.len(),
            error = %err,
            "failed to read error body"
        );
    }
    truncate_body(String::from_utf8_lossy(&bytes).into_owned(), limit)
}

fn fetch_cancelled() -> Error {
    Error::new(ErrorKind::Io).with_message("fetch cancelled")
}

fn truncate_body(mut body: String, limit: usize) -> String {
    if body.len() <= limit {
        return body;
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
    body.push_str("...");
    body
}

fn normalize_error_body(body: &str) -> String {
    if body.trim().is_empty() {
        "empty response body".to_string()
    } else {
        body.to_string()
    }
}
