// Declarative extractors and visibility rules used by file-configured registries.
use serde_json::{Map, Value, json};

use crate::core::identity::Identity;
use crate::core::record::Record;
use crate::core::registry::{SearchDataExtractable, VisibilityPredicate};

/// Source name that reads the record id instead of a field.
pub const ID_FIELD: &str = "ID";

/// Copies selected record fields under new output keys.
///
/// Missing source fields are emitted as `null` so every item of a type has
/// the same keys.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, output_key: impl Into<String>, source_field: impl Into<String>) -> Self {
        self.entries.push((output_key.into(), source_field.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, S: Into<String>> FromIterator<(K, S)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, S)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (key, source)| map.with(key, source))
    }
}

impl SearchDataExtractable for FieldMap {
    fn search_data(&self, record: &Record) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, source) in &self.entries {
            let value = if source == ID_FIELD {
                json!(record.id)
            } else {
                record.field(source).cloned().unwrap_or(Value::Null)
            };
            out.insert(key.clone(), value);
        }
        out
    }
}

/// Per-record access driven by the record's `CanViewType` field.
///
/// `Anyone`, `Inherit` or a missing field are public. `LoggedInUsers` admits
/// any authenticated identity. `OnlyTheseUsers` admits identities sharing a
/// group with the record's `ViewerGroups` array, plus admins. Anything else
/// is hidden.
#[derive(Clone, Copy, Debug, Default)]
pub struct CanViewTypeRule;

impl VisibilityPredicate for CanViewTypeRule {
    fn can_view(&self, record: &Record, identity: &Identity) -> bool {
        let view_type = record.field("CanViewType").and_then(Value::as_str);
        match view_type {
            None | Some("Anyone") | Some("Inherit") | Some("") => true,
            Some("LoggedInUsers") => !identity.username.is_empty(),
            Some("OnlyTheseUsers") => {
                if identity.is_admin() {
                    return true;
                }
                let groups = record
                    .field("ViewerGroups")
                    .and_then(Value::as_array)
                    .map(|groups| groups.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                    .unwrap_or_default();
                identity.in_any_group(groups)
            }
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CanViewTypeRule, FieldMap};
    use crate::core::identity::Identity;
    use crate::core::record::Record;
    use crate::core::registry::{SearchDataExtractable, VisibilityPredicate};
    use serde_json::{Map, Value, json};

    fn record(fields: Value) -> Record {
        match fields {
            Value::Object(map) => Record::new(7, "Page", map),
            _ => Record::new(7, "Page", Map::new()),
        }
    }

    #[test]
    fn field_map_renames_and_fills_nulls() {
        let map: FieldMap = [("title", "Title"), ("id", "ID"), ("summary", "Summary")]
            .into_iter()
            .collect();
        let data = map.search_data(&record(json!({"Title": "One", "Content": "x"})));
        assert_eq!(data.get("title"), Some(&json!("One")));
        assert_eq!(data.get("id"), Some(&json!(7)));
        assert_eq!(data.get("summary"), Some(&Value::Null));
        assert!(data.get("Content").is_none());
    }

    #[test]
    fn can_view_type_rules() {
        let rule = CanViewTypeRule;
        let editor = Identity::new("api-member").with_group("editors");
        let admin = Identity::new("root").with_permission("ADMIN");

        assert!(rule.can_view(&record(json!({})), &editor));
        assert!(rule.can_view(&record(json!({"CanViewType": "Anyone"})), &editor));
        assert!(rule.can_view(&record(json!({"CanViewType": "LoggedInUsers"})), &editor));

        let restricted = record(json!({
            "CanViewType": "OnlyTheseUsers",
            "ViewerGroups": ["administrators"]
        }));
        assert!(!rule.can_view(&restricted, &editor));
        assert!(rule.can_view(&restricted, &admin));

        let shared = record(json!({
            "CanViewType": "OnlyTheseUsers",
            "ViewerGroups": ["editors"]
        }));
        assert!(rule.can_view(&shared, &editor));

        assert!(!rule.can_view(&record(json!({"CanViewType": "Nobody"})), &admin));
    }
}
