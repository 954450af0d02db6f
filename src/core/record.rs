//! Purpose: Model exportable records and the store they are fetched from.
//! Exports: `Record`, `ReadingMode`, `PageQuery`, `RecordStore`, `MemoryStore`, `StoredRecord`.
//! Role: Stand-in for the host ORM; the export path only needs id-ordered page fetches.
//! Invariants: Record ids are positive and unique per type.
//! Invariants: Reading mode is an explicit fetch parameter, never ambient state.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub id: u64,
    pub record_type: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: u64, record_type: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadingMode {
    Draft,
    Live,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageQuery {
    pub after_id: u64,
    pub limit: usize,
    pub mode: ReadingMode,
}

pub trait RecordStore: Send + Sync {
    /// Records of `record_type` with `id > after_id`, ascending by id, at most `limit`.
    ///
    /// Types the store has never seen yield an empty page.
    fn fetch_page(&self, record_type: &str, query: PageQuery) -> Result<Vec<Record>, Error>;
}

/// One stored row as it appears in a data file.
///
/// Unversioned rows carry `fields` and read the same in both modes. Versioned
/// rows carry `draft` and/or `live`; a missing stage means the row does not
/// exist in that mode.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoredRecord {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<Map<String, Value>>,
}

impl StoredRecord {
    pub fn unversioned(id: u64, fields: Map<String, Value>) -> Self {
        Self {
            id,
            fields: Some(fields),
            ..Self::default()
        }
    }

    pub fn versioned(
        id: u64,
        draft: Option<Map<String, Value>>,
        live: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            id,
            fields: None,
            draft,
            live,
        }
    }

    fn read(&self, mode: ReadingMode) -> Option<&Map<String, Value>> {
        if let Some(fields) = &self.fields {
            return Some(fields);
        }
        match mode {
            ReadingMode::Draft => self.draft.as_ref(),
            ReadingMode::Live => self.live.as_ref(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.id == 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record id must be positive"));
        }
        if self.fields.is_some() && (self.draft.is_some() || self.live.is_some()) {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "record {} mixes unversioned fields with draft/live stages",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    types: BTreeMap<String, BTreeMap<u64, StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record_type: &str, record: StoredRecord) -> Result<(), Error> {
        record.validate()?;
        let rows = self.types.entry(record_type.to_string()).or_default();
        if rows.contains_key(&record.id) {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "duplicate record id {} for type {record_type}",
                record.id
            )));
        }
        rows.insert(record.id, record);
        Ok(())
    }

    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self, record_type: &str) -> usize {
        self.types.get(record_type).map_or(0, BTreeMap::len)
    }
}

impl RecordStore for MemoryStore {
    fn fetch_page(&self, record_type: &str, query: PageQuery) -> Result<Vec<Record>, Error> {
        let Some(rows) = self.types.get(record_type) else {
            return Ok(Vec::new());
        };
        let Some(start) = query.after_id.checked_add(1) else {
            return Ok(Vec::new());
        };
        let page = rows
            .range(start..)
            .filter_map(|(id, row)| {
                row.read(query.mode)
                    .map(|fields| Record::new(*id, record_type, fields.clone()))
            })
            .take(query.limit)
            .collect();
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryStore, PageQuery, ReadingMode, RecordStore, StoredRecord};
    use crate::core::error::ErrorKind;
    use serde_json::{Map, Value, json};

    fn fields(title: &str) -> Map<String, Value> {
        match json!({ "Title": title }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn live(after_id: u64, limit: usize) -> PageQuery {
        PageQuery {
            after_id,
            limit,
            mode: ReadingMode::Live,
        }
    }

    #[test]
    fn pages_are_ascending_and_bounded() {
        let mut store = MemoryStore::new();
        for id in [3, 1, 2, 5] {
            store
                .insert("Page", StoredRecord::unversioned(id, fields(&id.to_string())))
                .expect("insert");
        }

        let first = store.fetch_page("Page", live(0, 2)).expect("fetch");
        let ids: Vec<u64> = first.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let second = store.fetch_page("Page", live(2, 2)).expect("fetch");
        let ids: Vec<u64> = second.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![3, 5]);

        assert!(store.fetch_page("Page", live(5, 2)).expect("fetch").is_empty());
        assert!(
            store
                .fetch_page("Page", live(u64::MAX, 2))
                .expect("fetch")
                .is_empty()
        );
    }

    #[test]
    fn live_mode_skips_draft_only_rows() {
        let mut store = MemoryStore::new();
        store
            .insert("Page", StoredRecord::versioned(1, Some(fields("draft")), None))
            .expect("insert");
        store
            .insert(
                "Page",
                StoredRecord::versioned(2, Some(fields("new")), Some(fields("old"))),
            )
            .expect("insert");

        let page = store.fetch_page("Page", live(0, 10)).expect("fetch");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 2);
        assert_eq!(page[0].field("Title"), Some(&json!("old")));

        let draft = store
            .fetch_page(
                "Page",
                PageQuery {
                    after_id: 0,
                    limit: 10,
                    mode: ReadingMode::Draft,
                },
            )
            .expect("fetch");
        assert_eq!(draft.len(), 2);
        assert_eq!(draft[1].field("Title"), Some(&json!("new")));
    }

    #[test]
    fn unknown_type_is_empty() {
        let store = MemoryStore::new();
        assert!(store.fetch_page("Nope", live(0, 10)).expect("fetch").is_empty());
    }

    #[test]
    fn rejects_duplicate_and_zero_ids() {
        let mut store = MemoryStore::new();
        store
            .insert("Page", StoredRecord::unversioned(1, fields("a")))
            .expect("insert");
        let err = store
            .insert("Page", StoredRecord::unversioned(1, fields("b")))
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let err = store
            .insert("Page", StoredRecord::unversioned(0, fields("c")))
            .expect_err("zero id");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(store.len("Page"), 1);
    }
}
