//! Purpose: Operator configuration files: extractor config and members file.
//! Exports: `ExtractorConfig`, `ModelConfig`, `ExtensionConfig`, `VisibilityRule`, `load_members`.
//! Role: Turns JSON files into a populated `ExportRegistry`, `ExportSettings` and `MemberStore`.
//! Invariants: Every extension named by a model must be declared under `extensions`.
//! Invariants: Unknown keys are rejected so typos never silently widen exposure.
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{
    API_PERMISSION_CODE, CanViewTypeRule, DEFAULT_PAGINATION_LIMIT, DEFAULT_REALM, Error,
    ErrorKind, ExportRegistry, ExportSettings, FieldMap, Member, MemberStore, MetadataHook,
};
use crate::data_dir::map_io_error_kind;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractorConfig {
    #[serde(default = "default_pagination_limit")]
    pub pagination_limit: usize,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_permission_code")]
    pub permission_code: String,
    #[serde(default)]
    pub exposed_core_models: Vec<String>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionConfig>,
    #[serde(default)]
    pub envelope_metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Output key to source field; a model with a map exports natively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<VisibilityRule>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionConfig {
    /// Absent for extensions that do not implement export.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityRule {
    CanViewType,
}

fn default_pagination_limit() -> usize {
    DEFAULT_PAGINATION_LIMIT
}

fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}

fn default_permission_code() -> String {
    API_PERMISSION_CODE.to_string()
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            pagination_limit: default_pagination_limit(),
            realm: default_realm(),
            permission_code: default_permission_code(),
            exposed_core_models: Vec::new(),
            models: BTreeMap::new(),
            extensions: BTreeMap::new(),
            envelope_metadata: Map::new(),
        }
    }
}

impl ExtractorConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to read extractor config")
                .with_path(path)
                .with_source(err)
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid extractor config: {err}"))
                .with_path(path)
                .with_source(err)
        })?;
        config.validate().map_err(|err| err.with_path(path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pagination_limit == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("pagination_limit must be greater than zero")
                .with_hint("Use a positive value like 50."));
        }
        if self.permission_code.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("permission_code must not be empty"));
        }
        Ok(())
    }

    pub fn settings(&self) -> ExportSettings {
        ExportSettings {
            pagination_limit: self.pagination_limit,
            exposed_core_models: self.exposed_core_models.clone(),
        }
    }

    pub fn metadata_hook(&self) -> Option<MetadataHook> {
        (!self.envelope_metadata.is_empty())
            .then(|| MetadataHook::new(self.envelope_metadata.clone()))
    }

    pub fn build_registry(&self) -> Result<ExportRegistry, Error> {
        let mut registry = ExportRegistry::new();
        for (name, extension) in &self.extensions {
            match &extension.export {
                Some(fields) => registry.register_extension(name.clone(), field_map(fields)),
                None => registry.register_plain_extension(name.clone()),
            };
        }
        for (name, model) in &self.models {
            match &model.export {
                Some(fields) => registry.register_type(name.clone(), field_map(fields)),
                None => registry.register_model(name.clone()),
            };
            if let Some(VisibilityRule::CanViewType) = model.visibility {
                registry.set_visibility(name, CanViewTypeRule)?;
            }
            for extension in &model.extensions {
                registry
                    .attach_extension(name, extension)
                    .map_err(|err| err.with_hint(format!("Declare \"{extension}\" under \"extensions\".")))?;
            }
        }
        for core in &self.exposed_core_models {
            if !self.models.contains_key(core) {
                tracing::warn!(model = %core, "exposed core model is not declared under models");
            }
        }
        Ok(registry)
    }
}

fn field_map(fields: &BTreeMap<String, String>) -> FieldMap {
    fields
        .iter()
        .map(|(key, source)| (key.clone(), source.clone()))
        .collect()
}

pub fn load_members(path: &Path) -> Result<MemberStore, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_message("failed to read members file")
            .with_path(path)
            .with_source(err)
    })?;
    let members: Vec<Member> = serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid members file: {err}"))
            .with_path(path)
            .with_hint("Generate entries with `search-data-extractor hash-password`.")
            .with_source(err)
    })?;
    MemberStore::new(members).map_err(|err| err.with_path(path))
}

#[cfg(test)]
mod tests {
    use super::{ExtractorConfig, VisibilityRule, load_members};
    use crate::api::{Capability, ErrorKind, Identity, Record, hash_password};
    use serde_json::{Map, json};

    fn parse(value: serde_json::Value) -> ExtractorConfig {
        serde_json::from_value(value).expect("config")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(json!({}));
        assert_eq!(config.pagination_limit, 50);
        assert_eq!(config.realm, "Search Data Extractor API");
        assert_eq!(config.permission_code, "SEARCH_DATA_EXTRACTOR_ACCESS");
        assert!(config.metadata_hook().is_none());
    }

    #[test]
    fn builds_registry_with_extensions_and_visibility() {
        let config = parse(json!({
            "exposed_core_models": ["File"],
            "models": {
                "Page": {
                    "export": {"title": "Title", "content": "Content"},
                    "visibility": "can_view_type"
                },
                "File": {"extensions": ["Versioned", "FileSearchData"]},
                "Member": {}
            },
            "extensions": {
                "FileSearchData": {"export": {"title": "Title", "id": "ID"}},
                "Versioned": {}
            }
        }));
        assert_eq!(
            config.models["Page"].visibility,
            Some(VisibilityRule::CanViewType)
        );
        let registry = config.build_registry().expect("registry");
        let allowed = registry.allow_list(&config.exposed_core_models);
        assert_eq!(allowed.get("Page"), Some(&Capability::Native));
        assert_eq!(
            allowed.get("File"),
            Some(&Capability::Extension("FileSearchData".to_string()))
        );
        assert!(!allowed.contains_key("Member"));

        let page = registry
            .resolve("Page", &config.exposed_core_models)
            .expect("page");
        let predicate = page.visibility.expect("visibility");
        let mut fields = Map::new();
        fields.insert("CanViewType".to_string(), json!("Nobody"));
        assert!(!predicate.can_view(&Record::new(1, "Page", fields), &Identity::new("a")));

        let file = registry
            .resolve("File", &config.exposed_core_models)
            .expect("file");
        let data = file.extractor.search_data(&Record::new(4, "File", Map::new()));
        assert_eq!(data.get("id"), Some(&json!(4)));
    }

    #[test]
    fn undeclared_extension_is_a_usage_error() {
        let config = parse(json!({"models": {"File": {"extensions": ["Missing"]}}}));
        let err = config.build_registry().err().expect("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<ExtractorConfig, _> =
            serde_json::from_value(json!({"pagination_limt": 5}));
        assert!(result.is_err());
    }

    #[test]
    fn load_rejects_zero_page_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("extractor.json");
        std::fs::write(&path, "{\"pagination_limit\": 0}").expect("write");
        let err = ExtractorConfig::load(&path).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn loads_members_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("members.json");
        let body = json!([{
            "username": "api-member",
            "salt": "abcd",
            "password_sha256": hash_password("abcd", "api-member-pw"),
            "permissions": ["SEARCH_DATA_EXTRACTOR_ACCESS"]
        }]);
        std::fs::write(&path, body.to_string()).expect("write");
        let members = load_members(&path).expect("members");
        assert_eq!(members.len(), 1);
        assert!(members.verify("api-member", "api-member-pw").is_some());
    }
}
