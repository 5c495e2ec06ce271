//! Purpose: Define the public Rust API of the zeroeventhub crate.
//! Exports: Client, server handlers, receivers, wire model and errors.
//! Role: The one import path for applications; `core` stays an implementation detail.
//! Invariants: Additive-only; re-exports keep their names across releases.

mod client;
mod server;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::model::{
    ALL_HEADERS, Cursor, DEFAULT_PAGE_SIZE, Dialect, Envelope, FIRST_CURSOR, FeedInfo, Headers,
    LAST_CURSOR, LEGACY_TOKEN, Options, Partition, TypedEnvelope,
};
pub use crate::core::ndjson::{NdjsonEncoder, Record, RecordReader};
pub use crate::core::receiver::{EventPage, EventPageRaw, EventReceiver};
pub use client::{CancelToken, Client, FetchContext};
pub use server::{EventPublisher, HttpHandlers};
