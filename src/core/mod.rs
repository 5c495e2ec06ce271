// Protocol core: data model, wire codec, query addressing and errors.
pub mod error;
pub mod model;
pub mod ndjson;
pub mod query;
pub mod receiver;
