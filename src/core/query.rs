// Translation between cursors/options and HTTP query parameters.
use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Cursor, DEFAULT_PAGE_SIZE, Dialect, Options};
use std::time::Duration;

pub const PARTITION_COUNT: &str = "n";
pub const PAGE_SIZE_HINT: &str = "pagesizehint";
pub const HEADERS: &str = "headers";
pub const WAIT: &str = "wait";
pub const STREAM: &str = "stream";
pub const TOKEN: &str = "token";
pub const PARTITION: &str = "partition";
pub const CURSOR: &str = "cursor";

/// Name of the legacy per-partition cursor parameter, `cursor<N>`.
pub fn cursor_param(partition_id: i64) -> String {
    format!("{CURSOR}{partition_id}")
}

/// Decoded query string; when a key repeats, the first value wins.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn parse(raw: Option<&str>) -> Self {
        let pairs = raw
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        Self { pairs }
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Legacy request parameters: handshake, one `cursor<N>` per cursor, options.
pub fn encode_legacy(
    partition_count: usize,
    cursors: &[Cursor],
    options: &Options,
) -> Vec<(String, String)> {
    let mut pairs = vec![(PARTITION_COUNT.to_string(), partition_count.to_string())];
    if options.page_size_hint != DEFAULT_PAGE_SIZE {
        pairs.push((PAGE_SIZE_HINT.to_string(), options.page_size_hint.to_string()));
    }
    for cursor in cursors {
        pairs.push((cursor_param(cursor.partition_id), cursor.cursor.clone()));
    }
    encode_long_poll(&mut pairs, options);
    pairs
}

/// Current-dialect request parameters for a single partition.
pub fn encode_current(token: &str, cursor: &Cursor, options: &Options) -> Vec<(String, String)> {
    let mut pairs = vec![
        (TOKEN.to_string(), token.to_string()),
        (PARTITION.to_string(), cursor.partition_id.to_string()),
        (CURSOR.to_string(), cursor.cursor.clone()),
    ];
    if options.page_size_hint != DEFAULT_PAGE_SIZE {
        pairs.push((PAGE_SIZE_HINT.to_string(), options.page_size_hint.to_string()));
    }
    encode_long_poll(&mut pairs, options);
    pairs
}

fn encode_long_poll(pairs: &mut Vec<(String, String)>, options: &Options) {
    if let Some(headers) = options.headers.as_ref().filter(|h| !h.is_empty()) {
        pairs.push((HEADERS.to_string(), headers.join(",")));
    }
    if !options.wait.is_zero() {
        pairs.push((WAIT.to_string(), options.wait.as_millis().to_string()));
    }
    if !options.stream.is_zero() {
        pairs.push((STREAM.to_string(), options.stream.as_millis().to_string()));
    }
}

/// Checks the `n` handshake against the partition count the feed advertises.
pub fn check_partition_count(params: &QueryParams, expected: usize) -> Result<(), Error> {
    let Some(raw) = params.get(PARTITION_COUNT) else {
        return Err(Error::handshake_partition_count_missing());
    };
    let n: i64 = raw.parse().map_err(|err: std::num::ParseIntError| {
        Error::new(ErrorKind::Usage)
            .with_message(err.to_string())
            .with_source(err)
    })?;
    if n != expected as i64 {
        return Err(Error::handshake_partition_count_mismatch());
    }
    Ok(())
}

/// Parses `pagesizehint`, `headers`, `wait` and `stream`.
pub fn parse_options(params: &QueryParams, dialect: Dialect) -> Result<Options, Error> {
    let mut options = Options::default();
    if let Some(raw) = params.get(PAGE_SIZE_HINT) {
        options.page_size_hint = raw.parse().map_err(|err: std::num::ParseIntError| {
            let message = match dialect {
                Dialect::Legacy => err.to_string(),
                Dialect::Current => "pagesizehint not an integer".to_string(),
            };
            Error::new(ErrorKind::Usage)
                .with_message(message)
                .with_source(err)
        })?;
    }
    if let Some(raw) = params.get(HEADERS) {
        options.headers = Some(
            raw.strip_suffix(',')
                .unwrap_or(raw)
                .split(',')
                .map(str::to_string)
                .collect(),
        );
    }
    options.wait = parse_millis(params, WAIT)?;
    options.stream = parse_millis(params, STREAM)?;
    Ok(options)
}

fn parse_millis(params: &QueryParams, key: &str) -> Result<Duration, Error> {
    let Some(raw) = params.get(key) else {
        return Ok(Duration::ZERO);
    };
    let millis: u64 = raw.parse().map_err(|err: std::num::ParseIntError| {
        Error::new(ErrorKind::Usage)
            .with_message(err.to_string())
            .with_source(err)
    })?;
    Ok(Duration::from_millis(millis))
}

/// Collects `cursor<i>` for `i` in `0..partition_count`, in partition order.
pub fn parse_cursors(params: &QueryParams, partition_count: usize) -> Vec<Cursor> {
    (0..partition_count as i64)
        .filter_map(|partition_id| {
            params
                .get(&cursor_param(partition_id))
                .map(|cursor| Cursor::new(partition_id, cursor))
        })
        .collect()
}

/// The legacy dialect carries exactly one cursor per request.
pub fn parse_single_cursor(params: &QueryParams, partition_count: usize) -> Result<Cursor, Error> {
    let mut cursors = parse_cursors(params, partition_count);
    match cursors.len() {
        0 => Err(Error::cursors_missing()),
        1 => Ok(cursors.remove(0)),
        _ => Err(Error::too_many_cursors()),
    }
}
