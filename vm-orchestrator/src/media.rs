//! Catalog of storage media known to the orchestrator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use vm_core::{AccessMode, DeviceType, MachineId, MediumId};
use vm_provider::MediumInfo;

use crate::error::{OrchestratorError, Result};

/// Controller slot a medium occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumAttachment {
    pub machine: MachineId,
    pub controller: String,
    pub port: u32,
    pub device: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMedium {
    pub id: MediumId,
    pub name: String,
    pub location: String,
    pub description: String,
    pub format: String,
    pub kind: DeviceType,
    pub access_mode: AccessMode,
    pub logical_size: u64,
    pub attachment: Option<MediumAttachment>,
}

impl StorageMedium {
    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }
}

impl From<&MediumInfo> for StorageMedium {
    fn from(info: &MediumInfo) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            location: info.location.clone(),
            description: info.description.clone(),
            format: info.format.clone(),
            kind: info.device_type,
            access_mode: info.access_mode,
            logical_size: info.logical_size,
            attachment: None,
        }
    }
}

/// Media by id. Each medium occupies at most one controller slot.
#[derive(Debug, Default)]
pub(crate) struct MediaCatalog {
    media: HashMap<MediumId, StorageMedium>,
}

impl MediaCatalog {
    /// Inserts or refreshes a medium, keeping its current attachment.
    pub fn upsert(&mut self, info: &MediumInfo) -> StorageMedium {
        let entry = self
            .media
            .entry(info.id)
            .or_insert_with(|| StorageMedium::from(info));
        let attachment = entry.attachment.take();
        *entry = StorageMedium::from(info);
        entry.attachment = attachment;
        entry.clone()
    }

    pub fn get(&self, id: &MediumId) -> Option<&StorageMedium> {
        self.media.get(id)
    }

    pub fn list(&self) -> Vec<StorageMedium> {
        let mut media: Vec<StorageMedium> = self.media.values().cloned().collect();
        media.sort_by(|a, b| a.location.cmp(&b.location));
        media
    }

    pub fn set_logical_size(&mut self, id: &MediumId, size: u64) {
        if let Some(medium) = self.media.get_mut(id) {
            medium.logical_size = size;
        }
    }

    /// Fails when the medium is unknown or already occupies a slot.
    pub fn check_attachable(&self, id: &MediumId) -> Result<&StorageMedium> {
        let medium = self
            .media
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("medium {}", id)))?;
        if let Some(existing) = &medium.attachment {
            return Err(OrchestratorError::InvalidState(format!(
                "medium '{}' is already attached to {}:{}:{}",
                medium.location, existing.controller, existing.port, existing.device
            )));
        }
        Ok(medium)
    }

    pub fn attach(&mut self, id: &MediumId, attachment: MediumAttachment) -> Result<()> {
        self.check_attachable(id)?;
        if let Some(medium) = self.media.get_mut(id) {
            medium.attachment = Some(attachment);
        }
        Ok(())
    }

    /// Clears every attachment held by `machine`.
    pub fn detach_machine(&mut self, machine: &MachineId) {
        for medium in self.media.values_mut() {
            if medium
                .attachment
                .as_ref()
                .is_some_and(|a| &a.machine == machine)
            {
                medium.attachment = None;
            }
        }
    }

    pub fn remove(&mut self, id: &MediumId) -> Option<StorageMedium> {
        self.media.remove(id)
    }
}
