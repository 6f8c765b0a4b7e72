use std::collections::HashMap;
use std::sync::RwLock;

use batchflow_core::{JobDefinition, JobDefinitionId};

use crate::error::{BatchError, BatchResult};

/// Job definitions known to this process, by id.
///
/// Maintenance and chunk workers resolve an instance's definition here; an
/// instance whose definition is not registered is skipped with a warning.
#[derive(Debug, Default)]
pub struct JobDefinitionRegistry {
    definitions: RwLock<HashMap<JobDefinitionId, JobDefinition>>,
}

impl JobDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `definition`. Re-registering an id requires a newer version.
    pub fn register(&self, definition: JobDefinition) -> BatchResult<()> {
        let mut defs = self
            .definitions
            .write()
            .map_err(|_| BatchError::Storage("definition registry lock poisoned".to_string()))?;

        if let Some(existing) = defs.get(&definition.id) {
            if existing.version >= definition.version {
                return Err(BatchError::validation(format!(
                    "job definition '{}' version {} is already registered",
                    definition.id, existing.version
                )));
            }
        }
        defs.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn get(&self, id: &JobDefinitionId) -> BatchResult<JobDefinition> {
        self.definitions
            .read()
            .map_err(|_| BatchError::Storage("definition registry lock poisoned".to_string()))?
            .get(id)
            .cloned()
            .ok_or_else(|| BatchError::not_found(format!("job definition '{id}'")))
    }

    pub fn len(&self) -> usize {
        self.definitions.read().map(|d| d.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
