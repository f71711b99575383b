//! Append-only audit trail of user-visible actions.
//!
//! Entries are stored in the `auditLog` collection and ride along with every snapshot, so
//! undoing an action also removes its audit entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::collection::Collection;
use crate::records::AuditRecord;
use crate::{CollectionName, RecordId, StateError};

/// Mutable access to the audit log of a store.
#[derive(Debug)]
pub struct AuditTrail<'a> {
    log: &'a mut Collection<AuditRecord>,
}

impl<'a> AuditTrail<'a> {
    pub(crate) fn new(log: &'a mut Collection<AuditRecord>) -> Self {
        Self { log }
    }

    /// Append an entry stamped with the current time.
    ///
    /// # Errors
    /// Returns an error when the description is empty.
    pub fn append(
        &mut self,
        description: impl Into<String>,
        details: Value,
    ) -> Result<RecordId, StateError> {
        self.append_at(OffsetDateTime::now_utc(), description, details)
    }

    /// Append an entry stamped with `at`.
    ///
    /// The stored timestamp never goes backwards: an `at` older than the newest entry is
    /// raised to that entry's timestamp.
    ///
    /// # Errors
    /// Returns an error when the description is empty.
    pub fn append_at(
        &mut self,
        at: OffsetDateTime,
        description: impl Into<String>,
        details: Value,
    ) -> Result<RecordId, StateError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(StateError::Validation("audit description must not be empty".to_string()));
        }
        let timestamp = match self.log.last() {
            Some(previous) if previous.timestamp > at => previous.timestamp,
            _ => at,
        };
        let record = AuditRecord {
            id: RecordId::generate(CollectionName::AuditLog.id_prefix()),
            timestamp,
            description,
            details,
        };
        let id = record.id.clone();
        self.log.insert(record)?;
        Ok(id)
    }

    /// Remove every entry; nothing is recorded about the clear itself.
    pub fn clear(&mut self) -> usize {
        let removed = self.log.len();
        self.log.clear();
        removed
    }
}

/// Read access to the audit log of a store.
#[derive(Debug, Clone, Copy)]
pub struct AuditView<'a> {
    log: &'a Collection<AuditRecord>,
}

impl<'a> AuditView<'a> {
    pub(crate) fn new(log: &'a Collection<AuditRecord>) -> Self {
        Self { log }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &'a [AuditRecord] {
        self.log.as_slice()
    }

    #[must_use]
    pub fn query(&self, query: &AuditQuery) -> Vec<&'a AuditRecord> {
        query.run(self.log.as_slice())
    }
}

/// Filter for listing audit entries, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    /// Case-insensitive substring matched against the description and the details.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditQuery {
    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if self.from.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        match self.text.as_deref().map(str::trim).filter(|text| !text.is_empty()) {
            Some(text) => {
                let needle = text.to_lowercase();
                record.description.to_lowercase().contains(&needle)
                    || (!record.details.is_null()
                        && record.details.to_string().to_lowercase().contains(&needle))
            }
            None => true,
        }
    }

    /// Apply the filter to `entries` and page the result, newest first.
    ///
    /// Entries with equal timestamps keep reverse insertion order.
    #[must_use]
    pub fn run<'a>(&self, entries: &'a [AuditRecord]) -> Vec<&'a AuditRecord> {
        let mut matched =
            entries.iter().rev().filter(|record| self.matches(record)).collect::<Vec<_>>();
        matched.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        let page = matched.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;
    use crate::DocumentStore;

    #[test]
    fn append_rejects_empty_description() {
        let mut store = DocumentStore::initialize_default();
        let result = store.audit_mut().append("   ", Value::Null);
        assert!(matches!(result, Err(StateError::Validation(_))));
        assert!(store.audit().is_empty());
    }

    #[test]
    fn timestamps_never_decrease() {
        let mut store = DocumentStore::initialize_default();
        let now = OffsetDateTime::now_utc();
        let mut trail = store.audit_mut();
        for (offset, description) in [(0, "first"), (-60, "clock went back"), (5, "later")] {
            if let Err(err) = trail.append_at(now + Duration::seconds(offset), description, json!({}))
            {
                panic!("append should succeed: {err}");
            }
        }

        let entries = store.audit().entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].timestamp, now);
        assert!(entries.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
        assert!(entries.iter().all(|entry| entry.id.as_str().starts_with("LOG_")));
    }

    #[test]
    fn query_filters_by_text_and_range_newest_first() {
        let mut store = DocumentStore::initialize_default();
        let base = OffsetDateTime::now_utc();
        let mut trail = store.audit_mut();
        let fixtures = [
            (0, "Added customer Ahmed", json!({ "id": "C1" })),
            (10, "Added unit A-101", json!({ "code": "A-101" })),
            (20, "Deleted customer Mona", json!({ "id": "C2" })),
        ];
        for (offset, description, details) in fixtures {
            if let Err(err) = trail.append_at(base + Duration::seconds(offset), description, details)
            {
                panic!("append should succeed: {err}");
            }
        }

        let customers = store.audit().query(&AuditQuery {
            text: Some("CUSTOMER".to_string()),
            ..AuditQuery::default()
        });
        let descriptions = customers.iter().map(|r| r.description.as_str()).collect::<Vec<_>>();
        assert_eq!(descriptions, vec!["Deleted customer Mona", "Added customer Ahmed"]);

        let by_details = store.audit().query(&AuditQuery {
            text: Some("a-101".to_string()),
            ..AuditQuery::default()
        });
        assert_eq!(by_details.len(), 1);

        let window = store.audit().query(&AuditQuery {
            from: Some(base + Duration::seconds(5)),
            to: Some(base + Duration::seconds(15)),
            ..AuditQuery::default()
        });
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].description, "Added unit A-101");

        let paged = store.audit().query(&AuditQuery {
            offset: 1,
            limit: Some(1),
            ..AuditQuery::default()
        });
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].description, "Added unit A-101");
    }

    #[test]
    fn clear_removes_everything_silently() {
        let mut store = DocumentStore::initialize_default();
        for description in ["one", "two"] {
            if let Err(err) = store.audit_mut().append(description, Value::Null) {
                panic!("append should succeed: {err}");
            }
        }
        assert_eq!(store.audit_mut().clear(), 2);
        assert!(store.audit().is_empty());
    }
}
