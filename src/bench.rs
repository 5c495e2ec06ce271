// Load generator for a zeroeventhub feed.
//
// Purpose:
// - Measure how fast a feed can be replayed from the start (reconstitution) or polled at the head (tail).
// - Print one human-readable stats line per second to stdout; errors and progress go through tracing.
//
// Design notes:
// - Workers are plain threads, each with its own fetch loop and cursor; they share only the stats channel.
// - The reported rate is computed over the last ten samples, so it reacts quickly to changes.

use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::value::RawValue;

use zeroeventhub::api::{
    CancelToken, Client, Error, ErrorKind, EventReceiver, FIRST_CURSOR, FetchContext, Headers,
    LAST_CURSOR, Options,
};

const RATE_WINDOW: usize = 10;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub url: String,
    pub threads: usize,
    pub mode: BenchMode,
    pub partition: i64,
    pub page_size_hint: usize,
    pub legacy_partition_count: usize,
    pub poll_interval: Duration,
    pub duration: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BenchMode {
    /// Replay from `_first` until caught up; stats are events per second.
    Reconstitute,
    /// Poll from `_last`; stats are polls per second.
    Tail,
}

impl BenchMode {
    fn start_cursor(self) -> &'static str {
        match self {
            BenchMode::Reconstitute => FIRST_CURSOR,
            BenchMode::Tail => LAST_CURSOR,
        }
    }

    fn banner(self) -> &'static str {
        match self {
            BenchMode::Reconstitute => "reconstitution mode, stats are events/sec",
            BenchMode::Tail => "tail mode, stats are polls/sec",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BenchSummary {
    pub total: u64,
    pub elapsed: Duration,
}

pub fn validate_config(config: &BenchConfig) -> Result<(), Error> {
    if config.threads == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("--threads must be greater than zero"));
    }
    if config.legacy_partition_count == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--legacy-partitions must be greater than zero"));
    }
    if config.partition < 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("--partition must not be negative"));
    }
    if config.duration.is_some_and(|duration| duration.is_zero()) {
        return Err(Error::new(ErrorKind::Usage).with_message("--duration must be greater than zero"));
    }
    Ok(())
}

/// Runs the benchmark until every worker stops or `duration` elapses.
pub fn run_bench(config: BenchConfig, out: &mut dyn Write) -> Result<BenchSummary, Error> {
    validate_config(&config)?;
    let client = Client::new(config.url.clone())?
        .with_legacy_partition_count(config.legacy_partition_count);
    let feed = client.discover(&FetchContext::background())?;
    if feed.partition(config.partition).is_none() {
        return Err(Error::partition_not_found(config.partition));
    }
    writeln!(out, "{}", config.mode.banner()).map_err(write_error)?;

    let cancel = CancelToken::new();
    let (stats_tx, stats_rx) = mpsc::channel::<u64>();
    let mut workers = Vec::with_capacity(config.threads);
    for worker_id in 0..config.threads {
        let worker = Worker {
            id: worker_id,
            client: client.clone(),
            token: feed.token.clone(),
            config: config.clone(),
            cancel: cancel.clone(),
            stats: stats_tx.clone(),
        };
        workers.push(thread::spawn(move || worker.run()));
    }
    drop(stats_tx);

    let started = Instant::now();
    let deadline = config.duration.map(|duration| started + duration);
    let mut reporter = Reporter::new(started);
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left.min(REPORT_INTERVAL)
            }
            None => REPORT_INTERVAL,
        };
        match stats_rx.recv_timeout(wait) {
            Ok(sample) => {
                if let Some(line) = reporter.record(Instant::now(), sample) {
                    writeln!(out, "{line}").map_err(write_error)?;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    cancel.cancel();
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("bench worker panicked");
        }
    }
    // Samples sent between the deadline and cancellation still count.
    while let Ok(sample) = stats_rx.try_recv() {
        reporter.total += sample;
    }

    let summary = BenchSummary {
        total: reporter.total,
        elapsed: started.elapsed(),
    };
    writeln!(
        out,
        "done total={} elapsed_secs={:.2}",
        summary.total,
        summary.elapsed.as_secs_f64()
    )
    .map_err(write_error)?;
    Ok(summary)
}

struct Worker {
    id: usize,
    client: Client,
    token: String,
    config: BenchConfig,
    cancel: CancelToken,
    stats: mpsc::Sender<u64>,
}

impl Worker {
    fn run(self) {
        let ctx = FetchContext::background().with_cancel(self.cancel.clone());
        let options = Options::new().with_page_size_hint(self.config.page_size_hint);
        let mut cursor = self.config.mode.start_cursor().to_string();
        while !self.cancel.is_cancelled() {
            let mut page = PageStats::default();
            if let Err(err) = self.client.fetch_events(
                &ctx,
                &self.token,
                self.config.partition,
                &cursor,
                &mut page,
                &options,
            ) {
                if self.cancel.is_cancelled() {
                    break;
                }
                tracing::warn!(worker = self.id, error = %err, "fetch failed");
                thread::sleep(self.config.poll_interval);
                continue;
            }

            let sample = match self.config.mode {
                BenchMode::Reconstitute => page.events,
                BenchMode::Tail => 1,
            };
            if self.stats.send(sample).is_err() {
                break;
            }
            match (page.cursor, self.config.mode) {
                (Some(next), _) => cursor = next,
                (None, BenchMode::Reconstitute) => {
                    tracing::info!(worker = self.id, cursor = %cursor, "caught up");
                    break;
                }
                (None, BenchMode::Tail) => {}
            }
            if self.config.mode == BenchMode::Tail {
                thread::sleep(self.config.poll_interval);
            }
        }
    }
}

/// Counts events and remembers the last checkpoint of a page.
#[derive(Debug, Default)]
struct PageStats {
    events: u64,
    cursor: Option<String>,
}

impl EventReceiver for PageStats {
    fn on_event(
        &mut self,
        _partition_id: i64,
        _headers: Headers,
        _data: Box<RawValue>,
    ) -> Result<(), Error> {
        self.events += 1;
        Ok(())
    }

    fn on_checkpoint(&mut self, _partition_id: i64, cursor: String) -> Result<(), Error> {
        self.cursor = Some(cursor);
        Ok(())
    }
}

struct Reporter {
    total: u64,
    samples: Vec<(Instant, u64)>,
    last_print: Instant,
}

impl Reporter {
    fn new(started: Instant) -> Self {
        Self {
            total: 0,
            samples: vec![(started, 0)],
            last_print: started,
        }
    }

    fn record(&mut self, now: Instant, sample: u64) -> Option<String> {
        self.total += sample;
        self.samples.push((now, self.total));
        if now.duration_since(self.last_print) < REPORT_INTERVAL {
            return None;
        }
        self.last_print = now;
        let start = self.samples.len().saturating_sub(RATE_WINDOW);
        let (window_start, start_total) = self.samples[start];
        let (window_end, end_total) = self.samples[self.samples.len() - 1];
        let seconds = window_end.duration_since(window_start).as_secs_f64();
        let rate = if seconds > 0.0 {
            (end_total - start_total) as f64 / seconds
        } else {
            0.0
        };
        Some(format!("stats total={} rate/sec={rate:.2}", self.total))
    }
}

fn write_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write bench output")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{BenchConfig, BenchMode, PageStats, Reporter, validate_config};
    use std::time::{Duration, Instant};
    use zeroeventhub::api::{ErrorKind, EventReceiver, Headers};

    fn config() -> BenchConfig {
        BenchConfig {
            url: "http://127.0.0.1:8080/feed".to_string(),
            threads: 1,
            mode: BenchMode::Reconstitute,
            partition: 0,
            page_size_hint: 1000,
            legacy_partition_count: 1,
            poll_interval: Duration::from_millis(50),
            duration: None,
        }
    }

    #[test]
    fn validate_config_rejects_degenerate_values() {
        validate_config(&config()).expect("valid");

        let mut zero_threads = config();
        zero_threads.threads = 0;
        let err = validate_config(&zero_threads).expect_err("threads");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let mut zero_duration = config();
        zero_duration.duration = Some(Duration::ZERO);
        assert!(validate_config(&zero_duration).is_err());

        let mut negative = config();
        negative.partition = -1;
        assert!(validate_config(&negative).is_err());
    }

    #[test]
    fn reporter_prints_at_most_once_per_second() {
        let start = Instant::now();
        let mut reporter = Reporter::new(start);
        assert!(reporter.record(start + Duration::from_millis(100), 50).is_none());
        let line = reporter
            .record(start + Duration::from_millis(1100), 50)
            .expect("line");
        assert!(line.starts_with("stats total=100 rate/sec="));
        assert!(reporter.record(start + Duration::from_millis(1200), 1).is_none());
        assert_eq!(reporter.total, 101);
    }

    #[test]
    fn page_stats_track_events_and_last_cursor() {
        let mut stats = PageStats::default();
        let data = serde_json::value::RawValue::from_string("{}".to_string()).expect("raw");
        stats.on_event(0, Headers::new(), data).expect("event");
        stats.on_checkpoint(0, "1".to_string()).expect("checkpoint");
        stats.on_checkpoint(0, "2".to_string()).expect("checkpoint");
        assert_eq!(stats.events, 1);
        assert_eq!(stats.cursor.as_deref(), Some("2"));
    }
}
