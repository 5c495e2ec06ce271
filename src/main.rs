//! Purpose: `zeroeventhub` CLI entry point: inspect, fetch from and benchmark a feed.
//! Role: Binary crate root; parses args, runs one command, writes results to stdout.
//! Invariants: Fetched pages go to stdout as NDJSON in the legacy record layout (partition included).
//! Invariants: Logs go to stderr; errors are JSON on stderr unless stderr is a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use zeroeventhub::api::{
    Client, Dialect, Error, ErrorKind, FIRST_CURSOR, FetchContext, NdjsonEncoder, Options,
    to_exit_code,
};

mod bench;

use bench::{BenchConfig, BenchMode, run_bench};

#[derive(Parser)]
#[command(
    name = "zeroeventhub",
    version,
    about = "Pull events from a ZeroEventHub feed over HTTP",
    after_help = r#"EXAMPLES
  $ zeroeventhub discover http://localhost:8080/feed
  $ zeroeventhub fetch http://localhost:8080/feed --partition 1 --cursor _first
  $ zeroeventhub bench http://localhost:8080/feed --threads 4 --duration-secs 30"#
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print the feed's discovery document as JSON")]
    Discover {
        #[arg(help = "Feed URL (the discovery endpoint)")]
        url: String,
        #[arg(
            long = "legacy-partitions",
            help = "Treat a feed that rejects discovery as a legacy feed with this many partitions"
        )]
        legacy_partitions: Option<usize>,
    },
    #[command(about = "Fetch one page from a partition and print it as NDJSON")]
    Fetch(FetchArgs),
    #[command(about = "Measure replay or polling throughput of a feed")]
    Bench(BenchArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(help = "Feed URL (the discovery endpoint)")]
    url: String,
    #[arg(long, default_value_t = 0)]
    partition: i64,
    #[arg(long, default_value = FIRST_CURSOR, help = "Cursor to resume after (_first, _last or a stored value)")]
    cursor: String,
    #[arg(long, help = "Token from discovery; discovered when omitted")]
    token: Option<String>,
    #[arg(long = "page-size-hint", default_value_t = 0)]
    page_size_hint: usize,
    #[arg(long, value_delimiter = ',', help = "Headers to include (comma separated, _all for every header)")]
    headers: Vec<String>,
    #[arg(long = "wait-ms", default_value_t = 0, help = "Long-poll wait for new events")]
    wait_ms: u64,
    #[arg(long = "stream-ms", default_value_t = 0, help = "Keep streaming records for this long")]
    stream_ms: u64,
    #[arg(long = "timeout-ms", help = "Abort the fetch after this long")]
    timeout_ms: Option<u64>,
    #[arg(long = "legacy-partitions")]
    legacy_partitions: Option<usize>,
}

#[derive(Args)]
struct BenchArgs {
    #[arg(help = "Feed URL (the discovery endpoint)")]
    url: String,
    #[arg(short = 'n', long, default_value_t = 1)]
    threads: usize,
    #[arg(short = 't', long, help = "Poll from _last instead of replaying from _first")]
    tail: bool,
    #[arg(long, default_value_t = 0)]
    partition: i64,
    #[arg(long = "page-size-hint", default_value_t = 1000)]
    page_size_hint: usize,
    #[arg(long = "poll-interval-ms", default_value_t = 50)]
    poll_interval_ms: u64,
    #[arg(long = "duration-secs", help = "Stop after this many seconds")]
    duration_secs: Option<u64>,
    #[arg(long = "legacy-partitions", default_value_t = 1)]
    legacy_partitions: usize,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Discover {
            url,
            legacy_partitions,
        } => {
            let client = build_client(url, legacy_partitions)?;
            let info = client.discover(&FetchContext::background())?;
            let encoded = serde_json::to_string_pretty(&info).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode feed info")
                    .with_source(err)
            })?;
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{encoded}").map_err(stdout_error)
        }
        Command::Fetch(args) => fetch(args),
        Command::Bench(args) => {
            let config = BenchConfig {
                url: args.url,
                threads: args.threads,
                mode: if args.tail {
                    BenchMode::Tail
                } else {
                    BenchMode::Reconstitute
                },
                partition: args.partition,
                page_size_hint: args.page_size_hint,
                legacy_partition_count: args.legacy_partitions,
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                duration: args.duration_secs.map(Duration::from_secs),
            };
            let mut stdout = io::stdout().lock();
            run_bench(config, &mut stdout).map(drop)
        }
    }
}

fn fetch(args: FetchArgs) -> Result<(), Error> {
    let client = build_client(args.url, args.legacy_partitions)?;
    let mut ctx = FetchContext::background();
    if let Some(timeout_ms) = args.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(timeout_ms));
    }
    let token = match args.token {
        Some(token) => token,
        None => client.discover(&ctx)?.token,
    };

    let mut options = Options::new()
        .with_page_size_hint(args.page_size_hint)
        .with_wait(Duration::from_millis(args.wait_ms))
        .with_stream(Duration::from_millis(args.stream_ms));
    if !args.headers.is_empty() {
        options = options.with_headers(args.headers);
    }

    let stdout = io::stdout().lock();
    let mut encoder =
        NdjsonEncoder::new(stdout, Dialect::Legacy).streaming(!options.stream.is_zero());
    client.fetch_events(
        &ctx,
        &token,
        args.partition,
        &args.cursor,
        &mut encoder,
        &options,
    )?;
    encoder.finish().map(drop)
}

fn build_client(url: String, legacy_partitions: Option<usize>) -> Result<Client, Error> {
    let client = Client::new(url)?;
    Ok(match legacy_partitions {
        Some(partition_count) => client.with_legacy_partition_count(partition_count),
        None => client,
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn stdout_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write to stdout")
        .with_source(err)
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    err.message()
        .filter(|message| !message.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err.kind()))
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(status) = err.status() {
        inner.insert("status".to_string(), json!(status));
    }
    if let Some(partition) = err.partition() {
        inner.insert("partition".to_string(), json!(partition));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(status) = err.status() {
        lines.push(format!("status: {status}"));
    }
    if let Some(partition) = err.partition() {
        lines.push(format!("partition: {partition}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, error_json, error_text};
    use clap::Parser;
    use zeroeventhub::api::{Error, ErrorKind};

    #[test]
    fn error_json_carries_status_and_causes() {
        let err = Error::new(ErrorKind::Transport)
            .with_status(504)
            .with_message("empty response body")
            .with_source(std::io::Error::other("upstream"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Transport");
        assert_eq!(value["error"]["status"], 504);
        assert_eq!(value["error"]["message"], "empty response body");
        assert_eq!(value["error"]["causes"][0], "upstream");
    }

    #[test]
    fn error_text_falls_back_to_kind() {
        let err = Error::mock_gateway_timeout().with_status(504);
        let text = error_text(&err);
        assert!(text.starts_with("error: Publisher"));
        assert!(text.contains("status: 504"));
    }

    #[test]
    fn fetch_args_split_headers() {
        let cli = Cli::try_parse_from([
            "zeroeventhub",
            "fetch",
            "http://localhost/feed",
            "--partition",
            "1",
            "--headers",
            "content-type,foo",
        ])
        .expect("parse");
        match cli.command {
            Command::Fetch(args) => {
                assert_eq!(args.partition, 1);
                assert_eq!(args.cursor, "_first");
                assert_eq!(args.headers, vec!["content-type", "foo"]);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn bench_defaults_poll_every_fifty_millis() {
        let cli = Cli::try_parse_from(["zeroeventhub", "bench", "http://localhost/feed", "-t"])
            .expect("parse");
        match cli.command {
            Command::Bench(args) => {
                assert!(args.tail);
                assert_eq!(args.threads, 1);
                assert_eq!(args.page_size_hint, 1000);
                assert_eq!(args.poll_interval_ms, 50);
            }
            _ => panic!("expected bench"),
        }
    }
}
