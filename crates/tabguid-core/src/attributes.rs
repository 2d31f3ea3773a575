//! Per-tab annotations keyed by guid.
//!
//! Attributes live on the record, so they follow the identity across
//! restarts and reopenings. Only open tabs (records in `current`) can be
//! read or annotated.

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::guid::Guid;
use crate::record::AttributeMap;
use crate::registry::TabRegistry;

/// Borrowed view over the registry's attribute operations.
#[derive(Debug, Clone, Copy)]
pub struct Attributes<'a> {
    registry: &'a TabRegistry,
}

impl<'a> Attributes<'a> {
    pub(crate) fn new(registry: &'a TabRegistry) -> Self {
        Self { registry }
    }

    /// Set `name` to `value`, returning the previous value.
    pub fn set(&self, guid: &Guid, name: &str, value: impl Into<Value>) -> Result<Option<Value>> {
        let value = value.into();
        let previous = self.registry.update_record(guid, |record| {
            let previous = record.attributes.insert(name.to_string(), value.clone());
            let changed = previous.as_ref() != Some(&value);
            (previous, changed)
        })?;
        debug!(%guid, attribute = name, "attribute set");
        Ok(previous)
    }

    /// Current value of `name`, `None` when unset.
    pub fn get(&self, guid: &Guid, name: &str) -> Result<Option<Value>> {
        self.registry
            .read_record(guid, |record| record.attributes.get(name).cloned())
    }

    /// Remove `name`, returning the value it held.
    pub fn clear(&self, guid: &Guid, name: &str) -> Result<Option<Value>> {
        self.registry.update_record(guid, |record| {
            let previous = record.attributes.remove(name);
            let changed = previous.is_some();
            (previous, changed)
        })
    }

    /// Every attribute of the tab.
    pub fn all(&self, guid: &Guid) -> Result<AttributeMap> {
        self.registry
            .read_record(guid, |record| record.attributes.clone())
    }
}
