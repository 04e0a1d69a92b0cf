//! Provisioning requests.
//!
//! A `MachineSpec` is everything `provision` needs to build a machine from
//! scratch. It can be written as YAML:
//!
//! ```yaml
//! name: vmA
//! os_type: Fedora_64
//! memory_mb: 2048
//! controllers:
//!   - { name: SATA, bus: sata }
//!   - { name: IDE, bus: ide }
//! attachments:
//!   - controller: SATA
//!     port: 0
//!     device: 0
//!     device_type: hard-disk
//!     medium: { source: create, location: /vms/vmA/vmA.vdi, size_bytes: 16106127360 }
//!   - controller: IDE
//!     port: 1
//!     device: 0
//!     device_type: dvd
//!     medium: { source: open, location: /isos/fedora.iso }
//! boot_order: [dvd, hard-disk]
//! ```

use serde::{Deserialize, Serialize};
use vm_core::{AccessMode, DeviceType, GraphicsController, MediumVariant, StorageBus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,

    #[serde(default = "default_os_type")]
    pub os_type: String,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    #[serde(default = "default_vram_mb")]
    pub vram_mb: u32,

    #[serde(default)]
    pub graphics: GraphicsController,

    #[serde(default)]
    pub controllers: Vec<ControllerSpec>,

    #[serde(default)]
    pub attachments: Vec<AttachmentSpec>,

    /// Boot devices, first entry boots first.
    #[serde(default)]
    pub boot_order: Vec<DeviceType>,
}

fn default_os_type() -> String {
    "Other".to_string()
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_vram_mb() -> u32 {
    128
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSpec {
    pub name: String,
    pub bus: StorageBus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSpec {
    pub controller: String,
    pub port: u32,
    #[serde(default)]
    pub device: u32,
    pub device_type: DeviceType,
    /// `None` leaves an empty drive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<MediumSource>,
}

/// Where the medium for an attachment comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum MediumSource {
    /// A new image whose storage is allocated during provisioning.
    Create {
        location: String,
        #[serde(default = "default_disk_format")]
        format: String,
        size_bytes: u64,
        #[serde(default)]
        variant: MediumVariant,
    },
    /// An existing image on the backend host.
    Open {
        location: String,
        /// Defaults to read-only for optical and floppy media.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access: Option<AccessMode>,
    },
}

fn default_disk_format() -> String {
    "vdi".to_string()
}

impl MediumSource {
    pub fn location(&self) -> &str {
        match self {
            MediumSource::Create { location, .. } | MediumSource::Open { location, .. } => {
                location
            }
        }
    }
}

impl MachineSpec {
    pub fn new(name: impl Into<String>, os_type: impl Into<String>, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            os_type: os_type.into(),
            memory_mb,
            vram_mb: default_vram_mb(),
            graphics: GraphicsController::default(),
            controllers: Vec::new(),
            attachments: Vec::new(),
            boot_order: Vec::new(),
        }
    }

    pub fn with_controller(mut self, name: impl Into<String>, bus: StorageBus) -> Self {
        self.controllers.push(ControllerSpec {
            name: name.into(),
            bus,
        });
        self
    }

    /// Adds a new hard disk of `size_bytes` at `location`.
    pub fn with_new_disk(
        mut self,
        controller: impl Into<String>,
        port: u32,
        location: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        self.attachments.push(AttachmentSpec {
            controller: controller.into(),
            port,
            device: 0,
            device_type: DeviceType::HardDisk,
            medium: Some(MediumSource::Create {
                location: location.into(),
                format: default_disk_format(),
                size_bytes,
                variant: MediumVariant::Standard,
            }),
        });
        self
    }

    /// Inserts an existing optical image.
    pub fn with_dvd(
        mut self,
        controller: impl Into<String>,
        port: u32,
        device: u32,
        location: impl Into<String>,
    ) -> Self {
        self.attachments.push(AttachmentSpec {
            controller: controller.into(),
            port,
            device,
            device_type: DeviceType::Dvd,
            medium: Some(MediumSource::Open {
                location: location.into(),
                access: None,
            }),
        });
        self
    }

    pub fn with_boot_order(mut self, order: Vec<DeviceType>) -> Self {
        self.boot_order = order;
        self
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerSpec> {
        self.controllers.iter().find(|c| c.name == name)
    }

    pub fn from_yaml(yaml: &str) -> vm_core::Result<Self> {
        let spec: MachineSpec = serde_yaml_ng::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }
}
