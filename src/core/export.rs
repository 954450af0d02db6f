//! Purpose: Produce one page of the search export for an authenticated identity.
//! Exports: `Exporter`, `ExportSettings`, `ExportRequest`, `Envelope`, `RequestEcho`, `EnvelopeHook`, `MetadataHook`.
//! Role: Class validation, live-mode fetch, visibility filter, mapping and envelope assembly.
//! Invariants: Only live records are read; records hidden from the identity still consume the page.
//! Invariants: `request.after` echoes the offset used for this fetch, not the last id returned.
//! Invariants: Hooks run after assembly in registration order and never see rejected requests.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::cursor::{format_cursor, parse_offset};
use crate::core::error::{Error, ErrorKind};
use crate::core::identity::Identity;
use crate::core::record::{PageQuery, ReadingMode, RecordStore};
use crate::core::registry::{AllowList, ExportRegistry};

pub const DEFAULT_PAGINATION_LIMIT: usize = 50;

pub const MISSING_CLASS_MESSAGE: &str = "Sorry you need to specify a class.";
pub const CLASS_NOT_ALLOWED_MESSAGE: &str = "Sorry that class is not valid.";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportSettings {
    pub pagination_limit: usize,
    pub exposed_core_models: Vec<String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            pagination_limit: DEFAULT_PAGINATION_LIMIT,
            exposed_core_models: Vec::new(),
        }
    }
}

/// Raw query parameters of one export call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExportRequest {
    pub class: Option<String>,
    pub after: Option<String>,
}

impl ExportRequest {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            after: None,
        }
    }

    pub fn after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }
}

/// Builds a request from decoded query pairs; a repeated key keeps its last value
/// and unknown keys are ignored.
impl FromIterator<(String, String)> for ExportRequest {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
        let mut request = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "class" => request.class = Some(value),
                "after" => request.after = Some(value),
                _ => {}
            }
        }
        request
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RequestEcho {
    pub after: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    pub request: RequestEcho,
    pub items: Vec<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Post-assembly extension point for envelopes.
pub trait EnvelopeHook: Send + Sync {
    fn update_data(&self, envelope: &mut Envelope, request: &ExportRequest);
}

/// Merges fixed operator metadata into the envelope's top level.
#[derive(Clone, Debug, Default)]
pub struct MetadataHook {
    metadata: Map<String, Value>,
}

impl MetadataHook {
    pub fn new(metadata: Map<String, Value>) -> Self {
        Self { metadata }
    }
}

impl EnvelopeHook for MetadataHook {
    fn update_data(&self, envelope: &mut Envelope, _request: &ExportRequest) {
        for (key, value) in &self.metadata {
            if key == "request" || key == "items" {
                continue;
            }
            envelope.extra.insert(key.clone(), value.clone());
        }
    }
}

pub struct Exporter {
    store: Arc<dyn RecordStore>,
    registry: Arc<ExportRegistry>,
    settings: ExportSettings,
    hooks: Vec<Arc<dyn EnvelopeHook>>,
}

impl Exporter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<ExportRegistry>,
        settings: ExportSettings,
    ) -> Result<Self, Error> {
        if settings.pagination_limit == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("pagination limit must be greater than zero")
                .with_hint("Use a positive value like 50."));
        }
        Ok(Self {
            store,
            registry,
            settings,
            hooks: Vec::new(),
        })
    }

    pub fn with_hook(mut self, hook: impl EnvelopeHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn allow_list(&self) -> AllowList {
        self.registry.allow_list(&self.settings.exposed_core_models)
    }

    pub fn export(&self, request: &ExportRequest, identity: &Identity) -> Result<Envelope, Error> {
        let class = match request.class.as_deref() {
            Some(class) if !class.is_empty() && class != "0" => class,
            _ => return Err(Error::new(ErrorKind::MissingClass).with_message(MISSING_CLASS_MESSAGE)),
        };
        let Some(export) = self
            .registry
            .resolve(class, &self.settings.exposed_core_models)
        else {
            return Err(Error::new(ErrorKind::ClassNotAllowed).with_message(CLASS_NOT_ALLOWED_MESSAGE));
        };

        let offset = parse_offset(request.after.as_deref());
        let records = self.store.fetch_page(
            class,
            PageQuery {
                after_id: offset,
                limit: self.settings.pagination_limit,
                mode: ReadingMode::Live,
            },
        )?;
        let fetched = records.len();

        let items: Vec<Map<String, Value>> = records
            .iter()
            .filter(|record| {
                export
                    .visibility
                    .as_ref()
                    .is_none_or(|predicate| predicate.can_view(record, identity))
            })
            .map(|record| export.extractor.search_data(record))
            .collect();

        tracing::debug!(
            class = %export.name,
            capability = ?export.capability,
            offset,
            fetched,
            returned = items.len(),
            user = %identity.username,
            "export page"
        );

        let mut envelope = Envelope {
            request: RequestEcho {
                after: format_cursor(class, offset),
            },
            items,
            extra: Map::new(),
        };
        for hook in &self.hooks {
            hook.update_data(&mut envelope, request);
        }
        Ok(envelope)
    }
}
