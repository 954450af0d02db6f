//! Purpose: Registry of record types that can be exported and how to export them.
//! Exports: `SearchDataExtractable`, `VisibilityPredicate`, `ExportRegistry`, `Capability`, `AllowList`, `ExportType`.
//! Role: Explicit startup-time replacement for scanning types for an export marker.
//! Invariants: The allow-list is recomputed per request from registry + exposed core models.
//! Invariants: Extension exposure needs both operator listing and attachment to the model.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};
use crate::core::identity::Identity;
use crate::core::record::Record;

/// Maps a record to its external search representation.
pub trait SearchDataExtractable: Send + Sync {
    fn search_data(&self, record: &Record) -> Map<String, Value>;
}

/// Decides whether an identity may see a record.
pub trait VisibilityPredicate: Send + Sync {
    fn can_view(&self, record: &Record, identity: &Identity) -> bool;
}

impl<F> SearchDataExtractable for F
where
    F: Fn(&Record) -> Map<String, Value> + Send + Sync,
{
    fn search_data(&self, record: &Record) -> Map<String, Value> {
        self(record)
    }
}

impl<F> VisibilityPredicate for F
where
    F: Fn(&Record, &Identity) -> bool + Send + Sync,
{
    fn can_view(&self, record: &Record, identity: &Identity) -> bool {
        self(record, identity)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Capability {
    Native,
    Extension(String),
}

pub type AllowList = BTreeMap<String, Capability>;

/// Everything needed to export one allowed type.
#[derive(Clone)]
pub struct ExportType {
    pub name: String,
    pub capability: Capability,
    pub extractor: Arc<dyn SearchDataExtractable>,
    pub visibility: Option<Arc<dyn VisibilityPredicate>>,
}

#[derive(Default)]
struct Model {
    extractor: Option<Arc<dyn SearchDataExtractable>>,
    visibility: Option<Arc<dyn VisibilityPredicate>>,
    extensions: Vec<String>,
}

#[derive(Default)]
pub struct ExportRegistry {
    models: BTreeMap<String, Model>,
    extensions: BTreeMap<String, Option<Arc<dyn SearchDataExtractable>>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type that implements export natively.
    pub fn register_type(
        &mut self,
        name: impl Into<String>,
        extractor: impl SearchDataExtractable + 'static,
    ) -> &mut Self {
        self.models.entry(name.into()).or_default().extractor = Some(Arc::new(extractor));
        self
    }

    /// Register a model with no native export; core models are declared this way.
    pub fn register_model(&mut self, name: impl Into<String>) -> &mut Self {
        self.models.entry(name.into()).or_default();
        self
    }

    /// Register an extension that implements export.
    pub fn register_extension(
        &mut self,
        name: impl Into<String>,
        extractor: impl SearchDataExtractable + 'static,
    ) -> &mut Self {
        self.extensions
            .insert(name.into(), Some(Arc::new(extractor)));
        self
    }

    /// Register an extension that does not implement export.
    pub fn register_plain_extension(&mut self, name: impl Into<String>) -> &mut Self {
        self.extensions.entry(name.into()).or_insert(None);
        self
    }

    pub fn set_visibility(
        &mut self,
        model: &str,
        predicate: impl VisibilityPredicate + 'static,
    ) -> Result<&mut Self, Error> {
        let entry = self.models.get_mut(model).ok_or_else(|| unknown_model(model))?;
        entry.visibility = Some(Arc::new(predicate));
        Ok(self)
    }

    pub fn attach_extension(&mut self, model: &str, extension: &str) -> Result<&mut Self, Error> {
        if !self.extensions.contains_key(extension) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown extension {extension}"))
                .with_hint("Declare the extension before attaching it to a model."));
        }
        let entry = self.models.get_mut(model).ok_or_else(|| unknown_model(model))?;
        if !entry.extensions.iter().any(|name| name == extension) {
            entry.extensions.push(extension.to_string());
        }
        Ok(self)
    }

    /// Types that may be exported, given the operator's exposed core models.
    pub fn allow_list(&self, exposed_core_models: &[String]) -> AllowList {
        let mut allowed = AllowList::new();
        for (name, model) in &self.models {
            if model.extractor.is_some() {
                allowed.insert(name.clone(), Capability::Native);
            }
        }
        for core in exposed_core_models {
            if allowed.contains_key(core) {
                continue;
            }
            if let Some((extension, _)) = self.exporting_extension(core) {
                allowed.insert(core.clone(), Capability::Extension(extension.to_string()));
            }
        }
        allowed
    }

    /// Resolve an allowed type to its extractor and visibility predicate.
    pub fn resolve(&self, name: &str, exposed_core_models: &[String]) -> Option<ExportType> {
        let capability = self.allow_list(exposed_core_models).remove(name)?;
        let model = self.models.get(name)?;
        let extractor = match &capability {
            Capability::Native => model.extractor.clone()?,
            Capability::Extension(_) => self.exporting_extension(name)?.1,
        };
        Some(ExportType {
            name: name.to_string(),
            capability,
            extractor,
            visibility: model.visibility.clone(),
        })
    }

    // First attached extension that implements export wins.
    fn exporting_extension(&self, model: &str) -> Option<(&str, Arc<dyn SearchDataExtractable>)> {
        let entry = self.models.get(model)?;
        entry.extensions.iter().find_map(|name| {
            self.extensions
                .get(name)
                .and_then(Option::clone)
                .map(|extractor| (name.as_str(), extractor))
        })
    }
}

fn unknown_model(model: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("unknown model {model}"))
        .with_hint("Register the model before configuring it.")
}
