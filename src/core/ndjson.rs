// Newline-delimited JSON framing of events and checkpoints.
use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Cursor, Dialect, Envelope, Headers};
use crate::core::receiver::EventReceiver;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::io::{BufRead, Write};

/// One decoded wire line.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Event(Envelope),
    Checkpoint(Cursor),
}

impl Record {
    pub fn dispatch<R: EventReceiver + ?Sized>(self, receiver: &mut R) -> Result<(), Error> {
        match self {
            Record::Event(envelope) => {
                receiver.on_event(envelope.partition_id, envelope.headers, envelope.data)
            }
            Record::Checkpoint(cursor) => receiver.on_checkpoint(cursor.partition_id, cursor.cursor),
        }
    }
}

// Partially typed line: `data` is kept raw until a receiver wants it.
#[derive(Deserialize)]
struct LineRecord {
    #[serde(default)]
    partition: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    headers: Option<Headers>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// Decodes one line. Blank lines yield `Ok(None)`.
///
/// Lines without a `partition` field (current dialect) are attributed to
/// `default_partition`.
pub fn decode_line(line: &[u8], default_partition: i64) -> Result<Option<Record>, Error> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: LineRecord = serde_json::from_slice(line).map_err(|err| {
        Error::new(ErrorKind::Decode)
            .with_message("invalid ndjson record")
            .with_source(err)
    })?;
    let partition_id = parsed.partition.unwrap_or(default_partition);
    match parsed.cursor {
        Some(cursor) if !cursor.is_empty() => {
            Ok(Some(Record::Checkpoint(Cursor::new(partition_id, cursor))))
        }
        _ => {
            let Some(data) = parsed.data else {
                return Err(Error::new(ErrorKind::Decode)
                    .with_message("record has neither a cursor nor data")
                    .with_partition(partition_id));
            };
            Ok(Some(Record::Event(Envelope {
                partition_id,
                headers: parsed.headers.unwrap_or_default(),
                data,
            })))
        }
    }
}

/// Lazy, line-at-a-time decoder over a byte stream.
///
/// Yields records as soon as their line is complete and stops after the
/// first error; it cannot be restarted.
pub struct RecordReader<R> {
    reader: R,
    default_partition: i64,
    line: Vec<u8>,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            default_partition: 0,
            line: Vec::new(),
            line_no: 0,
            done: false,
        }
    }

    pub fn with_default_partition(mut self, partition_id: i64) -> Self {
        self.default_partition = partition_id;
        self
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn next_record(&mut self) -> Result<Option<Record>, Error> {
        loop {
            self.line.clear();
            let read = self.reader.read_until(b'\n', &mut self.line).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read ndjson stream")
                    .with_source(err)
            })?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line_no = self.line_no;
            match decode_line(&self.line, self.default_partition) {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => continue,
                Err(err) => {
                    let message = err.message().unwrap_or("invalid ndjson record");
                    let message = format!("{message} (line {line_no})");
                    return Err(err.with_message(message));
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[derive(Serialize)]
struct LegacyEvent<'a> {
    partition: i64,
    #[serde(skip_serializing_if = "no_headers")]
    headers: &'a Headers,
    data: &'a RawValue,
}

#[derive(Serialize)]
struct LegacyCheckpoint<'a> {
    partition: i64,
    cursor: &'a str,
}

#[derive(Serialize)]
struct CurrentEvent<'a> {
    #[serde(skip_serializing_if = "no_headers")]
    headers: &'a Headers,
    data: &'a RawValue,
}

#[derive(Serialize)]
struct CurrentCheckpoint<'a> {
    cursor: &'a str,
}

/// Pass-through receiver writing every record as one NDJSON line.
///
/// In streaming mode the writer is flushed after each line so records leave
/// the process as soon as they are produced.
pub struct NdjsonEncoder<W: Write> {
    writer: W,
    dialect: Dialect,
    flush_each_line: bool,
    line: Vec<u8>,
}

impl<W: Write> NdjsonEncoder<W> {
    pub fn new(writer: W, dialect: Dialect) -> Self {
        Self {
            writer,
            dialect,
            flush_each_line: false,
            line: Vec::with_capacity(256),
        }
    }

    pub fn streaming(mut self, flush_each_line: bool) -> Self {
        self.flush_each_line = flush_each_line;
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Flushes the underlying writer and hands it back.
    pub fn finish(mut self) -> Result<W, Error> {
        self.writer.flush().map_err(write_error)?;
        Ok(self.writer)
    }

    fn write_line<T: Serialize>(&mut self, record: &T) -> Result<(), Error> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, record).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode ndjson record")
                .with_source(err)
        })?;
        self.line.push(b'\n');
        self.writer.write_all(&self.line).map_err(write_error)?;
        if self.flush_each_line {
            self.writer.flush().map_err(write_error)?;
        }
        Ok(())
    }
}

impl<W: Write> EventReceiver for NdjsonEncoder<W> {
    fn on_event(
        &mut self,
        partition_id: i64,
        headers: Headers,
        data: Box<RawValue>,
    ) -> Result<(), Error> {
        match self.dialect {
            Dialect::Legacy => self.write_line(&LegacyEvent {
                partition: partition_id,
                headers: &headers,
                data: &data,
            }),
            Dialect::Current => self.write_line(&CurrentEvent {
                headers: &headers,
                data: &data,
            }),
        }
    }

    fn on_checkpoint(&mut self, partition_id: i64, cursor: String) -> Result<(), Error> {
        match self.dialect {
            Dialect::Legacy => self.write_line(&LegacyCheckpoint {
                partition: partition_id,
                cursor: &cursor,
            }),
            Dialect::Current => self.write_line(&CurrentCheckpoint { cursor: &cursor }),
        }
    }
}

fn no_headers(headers: &&Headers) -> bool {
    headers.is_empty()
}

fn write_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write ndjson record")
        .with_source(err)
}
