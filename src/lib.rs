//! Purpose: ZeroEventHub, a pull-based event feed protocol over HTTP.
//! Exports: `api` (client, server handlers, receivers) and `core` (wire model, codec, errors).
//! Role: Library behind the `zeroeventhub` CLI and the integration tests.
//! Invariants: Cursors are opaque strings apart from the `_first`/`_last` sentinels.
//! Invariants: No process-wide mutable state; transports and spans are per value.
pub mod api;
pub mod core;
