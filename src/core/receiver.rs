// Receiver capability fed by the codec, plus the in-memory page variants.
use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Cursor, Envelope, Headers, TypedEnvelope};
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Sink for decoded (client side) or emitted (publisher side) records.
///
/// An error returned from either method stops the record flow: the client
/// aborts the scan, and a publisher is expected to stop emitting.
pub trait EventReceiver {
    fn on_event(
        &mut self,
        partition_id: i64,
        headers: Headers,
        data: Box<RawValue>,
    ) -> Result<(), Error>;

    fn on_checkpoint(&mut self, partition_id: i64, cursor: String) -> Result<(), Error>;
}

impl<R: EventReceiver + ?Sized> EventReceiver for &mut R {
    fn on_event(
        &mut self,
        partition_id: i64,
        headers: Headers,
        data: Box<RawValue>,
    ) -> Result<(), Error> {
        (**self).on_event(partition_id, headers, data)
    }

    fn on_checkpoint(&mut self, partition_id: i64, cursor: String) -> Result<(), Error> {
        (**self).on_checkpoint(partition_id, cursor)
    }
}

/// Keeps raw envelopes and the checkpoints of one page in memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventPageRaw {
    pub events: Vec<Envelope>,
    /// Last cursor seen per partition.
    pub cursors: BTreeMap<i64, String>,
    /// Every checkpoint in arrival order.
    pub checkpoints: Vec<Cursor>,
}

impl EventPageRaw {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.cursors.clear();
        self.checkpoints.clear();
    }

    pub fn latest_cursors(&self) -> Vec<Cursor> {
        latest_cursors(&self.cursors)
    }
}

impl EventReceiver for EventPageRaw {
    fn on_event(
        &mut self,
        partition_id: i64,
        headers: Headers,
        data: Box<RawValue>,
    ) -> Result<(), Error> {
        self.events.push(Envelope {
            partition_id,
            headers,
            data,
        });
        Ok(())
    }

    fn on_checkpoint(&mut self, partition_id: i64, cursor: String) -> Result<(), Error> {
        self.cursors.insert(partition_id, cursor.clone());
        self.checkpoints.push(Cursor::new(partition_id, cursor));
        Ok(())
    }
}

/// Like [`EventPageRaw`], but decodes every payload into `T` on receipt.
#[derive(Clone, Debug, PartialEq)]
pub struct EventPage<T> {
    pub events: Vec<TypedEnvelope<T>>,
    pub cursors: BTreeMap<i64, String>,
    pub checkpoints: Vec<Cursor>,
}

impl<T> Default for EventPage<T> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            cursors: BTreeMap::new(),
            checkpoints: Vec::new(),
        }
    }
}

impl<T> EventPage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.cursors.clear();
        self.checkpoints.clear();
    }

    pub fn latest_cursors(&self) -> Vec<Cursor> {
        latest_cursors(&self.cursors)
    }
}

impl<T: DeserializeOwned> EventReceiver for EventPage<T> {
    fn on_event(
        &mut self,
        partition_id: i64,
        headers: Headers,
        data: Box<RawValue>,
    ) -> Result<(), Error> {
        let data = serde_json::from_str::<T>(data.get()).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("event payload does not match the expected type")
                .with_partition(partition_id)
                .with_source(err)
        })?;
        self.events.push(TypedEnvelope {
            partition_id,
            headers,
            data,
        });
        Ok(())
    }

    fn on_checkpoint(&mut self, partition_id: i64, cursor: String) -> Result<(), Error> {
        self.cursors.insert(partition_id, cursor.clone());
        self.checkpoints.push(Cursor::new(partition_id, cursor));
        Ok(())
    }
}

fn latest_cursors(cursors: &BTreeMap<i64, String>) -> Vec<Cursor> {
    cursors
        .iter()
        .map(|(partition_id, cursor)| Cursor::new(*partition_id, cursor.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{EventPage, EventPageRaw, EventReceiver};
    use crate::core::error::ErrorKind;
    use crate::core::model::{Cursor, Headers};
    use serde::Deserialize;
    use serde_json::value::RawValue;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        id: u32,
    }

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).expect("raw")
    }

    #[test]
    fn raw_page_keeps_last_cursor_per_partition() {
        let mut page = EventPageRaw::new();
        page.on_event(0, Headers::new(), raw(r#"{"id":1}"#)).expect("event");
        page.on_checkpoint(0, "1".to_string()).expect("checkpoint");
        page.on_checkpoint(1, "7".to_string()).expect("checkpoint");
        page.on_checkpoint(0, "2".to_string()).expect("checkpoint");

        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].data.get(), r#"{"id":1}"#);
        assert_eq!(page.checkpoints.len(), 3);
        assert_eq!(
            page.latest_cursors(),
            vec![Cursor::new(0, "2"), Cursor::new(1, "7")]
        );

        page.clear();
        assert!(page.events.is_empty());
        assert!(page.cursors.is_empty());
    }

    #[test]
    fn typed_page_decodes_payloads() {
        let mut page = EventPage::<Sample>::new();
        let mut headers = Headers::new();
        headers.insert("h1".to_string(), "v1".to_string());
        page.on_event(3, headers.clone(), raw(r#"{"id":9}"#))
            .expect("event");
        assert_eq!(page.events[0].data, Sample { id: 9 });
        assert_eq!(page.events[0].partition_id, 3);
        assert_eq!(page.events[0].headers, headers);
    }

    #[test]
    fn typed_page_rejects_mismatched_payload() {
        let mut page = EventPage::<Sample>::new();
        let err = page
            .on_event(2, Headers::new(), raw(r#"{"id":"nope"}"#))
            .expect_err("decode error");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(err.partition(), Some(2));
        assert!(page.events.is_empty());
    }

    #[test]
    fn receivers_work_through_mutable_references() {
        fn feed<R: EventReceiver>(mut receiver: R) {
            receiver
                .on_checkpoint(0, "5".to_string())
                .expect("checkpoint");
        }

        let mut page = EventPageRaw::new();
        feed(&mut page);
        assert_eq!(page.cursors.get(&0).map(String::as_str), Some("5"));
    }
}
