//! Purpose: Serve a publisher's event log over HTTP in both protocol dialects.
//! Exports: `EventPublisher`, `HttpHandlers`.
//! Role: Validates requests, runs the publisher off the async runtime, streams NDJSON back.
//! Invariants: Every validation failure is answered before the publisher runs.
//! Invariants: Publisher error text never reaches the client, except for the two mock errors.
//! Invariants: Once a body chunk is sent, a later publisher failure or panic aborts the body stream.
//! Notes: Body chunks flow through a bounded channel, so a slow client throttles the publisher.
#![allow(clippy::result_large_err)]

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use axum::{Json, Router};
use bytes::Bytes;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Span};

use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Cursor, Dialect, FeedInfo, Options};
use crate::core::ndjson::NdjsonEncoder;
use crate::core::query::{
    self, QueryParams, check_partition_count, parse_options, parse_single_cursor,
};
use crate::core::receiver::EventReceiver;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 16;

/// Storage side of a feed.
///
/// `fetch_events` is called on a blocking thread with exactly one cursor and
/// must emit records for `cursor.partition_id` through `receiver`, following
/// each event (or run of events) with a checkpoint. A receiver error means
/// the response can no longer be written; stop and return it.
pub trait EventPublisher: Send + Sync + 'static {
    /// Used in logs.
    fn name(&self) -> &str;

    fn feed_info(&self) -> FeedInfo;

    fn fetch_events(
        &self,
        cursor: &Cursor,
        receiver: &mut dyn EventReceiver,
        options: &Options,
    ) -> Result<(), Error>;
}

type SpanFactory = dyn Fn(&Uri) -> Span + Send + Sync;

/// HTTP entry points for one publisher.
///
/// The feed info is read once at construction; the legacy handshake and the
/// partition/token checks all validate against that snapshot.
pub struct HttpHandlers<P> {
    inner: Arc<HandlerState<P>>,
    span_factory: Arc<SpanFactory>,
}

struct HandlerState<P> {
    publisher: P,
    feed_info: FeedInfo,
}

impl<P> Clone for HttpHandlers<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            span_factory: Arc::clone(&self.span_factory),
        }
    }
}

struct FetchRequest {
    dialect: Dialect,
    cursor: Cursor,
    options: Options,
}

enum Frame {
    Data(Bytes),
    Failed(Error),
}

impl<P: EventPublisher> HttpHandlers<P> {
    pub fn new(publisher: P) -> Self {
        let feed_info = publisher.feed_info();
        Self {
            inner: Arc::new(HandlerState {
                publisher,
                feed_info,
            }),
            span_factory: Arc::new(default_span),
        }
    }

    /// Replaces the per-request span; request logs and publisher logs nest under it.
    pub fn with_span_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Uri) -> Span + Send + Sync + 'static,
    {
        self.span_factory = Arc::new(factory);
        self
    }

    pub fn publisher(&self) -> &P {
        &self.inner.publisher
    }

    pub fn feed_info(&self) -> &FeedInfo {
        &self.inner.feed_info
    }

    /// Installs discovery (which also answers legacy requests) at `path` and
    /// the current-dialect events endpoint at `path/events`.
    pub fn router(&self, path: &str) -> Router {
        let events_path = format!("{}/events", path.trim_end_matches('/'));
        Router::new()
            .route(path, self.discovery_route())
            .route(&events_path, self.events_route())
            .layer(TraceLayer::new_for_http())
    }

    pub fn discovery_route<S>(&self) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        get(discovery_handler::<P>).with_state(self.clone())
    }

    pub fn legacy_route<S>(&self) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        get(legacy_handler::<P>).with_state(self.clone())
    }

    pub fn events_route<S>(&self) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        get(events_handler::<P>).with_state(self.clone())
    }

    /// Serves the feed info, or a legacy page when the `n` handshake is present.
    pub async fn discovery(&self, uri: Uri, query: Option<String>) -> Response {
        let params = QueryParams::parse(query.as_deref());
        if params.has(query::PARTITION_COUNT) {
            return self.legacy_with_params(&uri, &params).await;
        }
        Json(&self.inner.feed_info).into_response()
    }

    pub async fn legacy(&self, uri: Uri, query: Option<String>) -> Response {
        let params = QueryParams::parse(query.as_deref());
        self.legacy_with_params(&uri, &params).await
    }

    pub async fn events(&self, uri: Uri, query: Option<String>) -> Response {
        let span = (self.span_factory)(&uri);
        let params = QueryParams::parse(query.as_deref());
        match self.current_request(&params) {
            Ok(request) => self.stream(span, request).await,
            Err(err) => reject(&span, err),
        }
    }

    async fn legacy_with_params(&self, uri: &Uri, params: &QueryParams) -> Response {
        let span = (self.span_factory)(uri);
        match self.legacy_request(params) {
            Ok(request) => self.stream(span, request).await,
            Err(err) => reject(&span, err),
        }
    }

    fn legacy_request(&self, params: &QueryParams) -> Result<FetchRequest, Error> {
        let partition_count = self.inner.feed_info.partitions.len();
        check_partition_count(params, partition_count)?;
        let options = parse_options(params, Dialect::Legacy)?;
        let cursor = parse_single_cursor(params, partition_count)?;
        Ok(FetchRequest {
            dialect: Dialect::Legacy,
            cursor,
            options,
        })
    }

    fn current_request(&self, params: &QueryParams) -> Result<FetchRequest, Error> {
        if params.get(query::TOKEN) != Some(self.inner.feed_info.token.as_str()) {
            return Err(Error::illegal_token());
        }
        let partition_id: i64 = params
            .get(query::PARTITION)
            .unwrap_or_default()
            .parse()
            .map_err(|err: std::num::ParseIntError| {
                Error::new(ErrorKind::Usage)
                    .with_message(err.to_string())
                    .with_source(err)
            })?;
        if self.inner.feed_info.partition(partition_id).is_none() {
            return Err(Error::partition_not_found(partition_id));
        }
        let options = parse_options(params, Dialect::Current)?;
        let Some(cursor) = params.get(query::CURSOR) else {
            return Err(Error::new(ErrorKind::Cursor)
                .with_message("no cursor argument")
                .with_partition(partition_id));
        };
        Ok(FetchRequest {
            dialect: Dialect::Current,
            cursor: Cursor::new(partition_id, cursor),
            options,
        })
    }

    async fn stream(&self, span: Span, request: FetchRequest) -> Response {
        let state = Arc::clone(&self.inner);
        span.in_scope(|| {
            tracing::info!(
                publisher = state.publisher.name(),
                partition_count = state.feed_info.partitions.len(),
                partition = request.cursor.partition_id,
                cursor = %request.cursor.cursor,
                page_size_hint = request.options.page_size_hint,
                headers = ?request.options.headers,
                wait_ms = millis(request.options.wait),
                stream_ms = millis(request.options.stream),
                "fetching events"
            );
        });

        let (tx, rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
        let panic_tx = tx.clone();
        let publisher_name = state.publisher.name().to_string();
        let partition_id = request.cursor.partition_id;
        let watch_span = span.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let writer = BodyWriter::new(tx.clone());
            let mut encoder = NdjsonEncoder::new(writer, request.dialect)
                .streaming(!request.options.stream.is_zero());
            let result = state
                .publisher
                .fetch_events(&request.cursor, &mut encoder, &request.options)
                .and_then(|()| encoder.finish().map(drop));
            if let Err(err) = result {
                tracing::error!(
                    publisher = state.publisher.name(),
                    partition = request.cursor.partition_id,
                    error = %err,
                    "fetch events failed"
                );
                let _ = tx.blocking_send(Frame::Failed(err));
            }
        });
        // A panic drops the writer without sending a failure frame.
        tokio::spawn(async move {
            if let Err(err) = worker.await {
                tracing::error!(
                    publisher = %publisher_name,
                    partition = partition_id,
                    error = %err,
                    "publisher panicked"
                );
                let failure = Error::new(ErrorKind::Internal).with_message("publisher panicked");
                let _ = panic_tx.send(Frame::Failed(failure)).await;
            }
        }
        .instrument(watch_span));

        let mut frames = ReceiverStream::new(rx);
        match frames.next().await {
            None => ndjson_response(Body::empty()),
            Some(Frame::Failed(err)) => publisher_error_response(&err),
            Some(Frame::Data(first)) => {
                let rest = frames.map(|frame| match frame {
                    Frame::Data(chunk) => Ok(chunk),
                    Frame::Failed(err) => Err(io::Error::other(err.to_string())),
                });
                let body = tokio_stream::once(Ok::<Bytes, io::Error>(first)).chain(rest);
                ndjson_response(Body::from_stream(body))
            }
        }
    }
}

async fn discovery_handler<P: EventPublisher>(
    State(handlers): State<HttpHandlers<P>>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Response {
    handlers.discovery(uri, query).await
}

async fn legacy_handler<P: EventPublisher>(
    State(handlers): State<HttpHandlers<P>>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Response {
    handlers.legacy(uri, query).await
}

async fn events_handler<P: EventPublisher>(
    State(handlers): State<HttpHandlers<P>>,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Response {
    handlers.events(uri, query).await
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_span(uri: &Uri) -> Span {
    tracing::info_span!("zeroeventhub", path = %uri.path())
}

/// Buffers encoder output and hands it to the response body in chunks.
///
/// `flush` sends whatever is buffered. Bytes still buffered when the writer
/// is dropped are discarded.
struct BodyWriter {
    tx: mpsc::Sender<Frame>,
    buffer: Vec<u8>,
}

impl BodyWriter {
    fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send(&mut self) -> io::Result<()> {
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx
            .blocking_send(Frame::Data(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= CHUNK_SIZE {
            self.send()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.send()
    }
}

fn reject(span: &Span, err: Error) -> Response {
    let status = err.kind().http_status();
    span.in_scope(|| {
        tracing::info!(status, error = %err, "request rejected");
    });
    text_response(status, err.message().unwrap_or("bad request"))
}

fn publisher_error_response(err: &Error) -> Response {
    match err.mock_status() {
        Some(status) => text_response(status, err.message().unwrap_or_default()),
        None => text_response(500, "Internal server error"),
    }
}

fn text_response(status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, format!("{message}\n")).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

fn ndjson_response(body: Body) -> Response {
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(NDJSON_CONTENT_TYPE),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::{BodyWriter, CHUNK_SIZE, Frame, millis, publisher_error_response, text_response};
    use crate::core::error::Error;
    use axum::http::StatusCode;
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn body_writer_sends_on_flush_and_when_full() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = BodyWriter::new(tx);
        writer.write_all(b"line\n").expect("write");
        assert!(rx.try_recv().is_err());
        writer.flush().expect("flush");
        match rx.try_recv() {
            Ok(Frame::Data(chunk)) => assert_eq!(&chunk[..], b"line\n"),
            _ => panic!("expected a data frame"),
        }
        writer.flush().expect("empty flush");
        assert!(rx.try_recv().is_err());

        writer.write_all(&vec![b'x'; CHUNK_SIZE]).expect("write");
        assert!(matches!(rx.try_recv(), Ok(Frame::Data(chunk)) if chunk.len() == CHUNK_SIZE));
    }

    #[test]
    fn body_writer_reports_a_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut writer = BodyWriter::new(tx);
        writer.write_all(b"line\n").expect("buffered");
        let err = writer.flush().expect_err("closed");
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn publisher_errors_hide_detail_unless_mocked() {
        let response = publisher_error_response(&Error::mock_internal("error when fetching events"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = publisher_error_response(&Error::mock_gateway_timeout());
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let response = publisher_error_response(&Error::cursors_missing());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn durations_log_as_saturated_millis() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::ZERO), 0);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn text_responses_are_plain_text() {
        let response = text_response(409, "illegal token");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok()),
            Some("text/plain; charset=utf-8")
        );
    }
}
