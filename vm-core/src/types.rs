//! Enums that cross the backend boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Class of configuration lock a session holds on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Exclusive claim; required for configuration changes.
    Write,
    /// Non-exclusive claim; enough for runtime control.
    Shared,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Write => "write",
            LockMode::Shared => "shared",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    HardDisk,
    Dvd,
    Floppy,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::HardDisk => "hard-disk",
            DeviceType::Dvd => "dvd",
            DeviceType::Floppy => "floppy",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Bus type of a storage controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBus {
    Ide,
    Sata,
    Scsi,
    Sas,
    Floppy,
    Usb,
    Pcie,
    VirtioScsi,
}

impl StorageBus {
    /// Number of ports a controller on this bus exposes.
    pub fn port_count(&self) -> u32 {
        match self {
            StorageBus::Ide => 2,
            StorageBus::Sata => 30,
            StorageBus::Scsi => 16,
            StorageBus::Sas => 255,
            StorageBus::Floppy => 1,
            StorageBus::Usb => 8,
            StorageBus::Pcie => 255,
            StorageBus::VirtioScsi => 256,
        }
    }

    /// Number of devices per port.
    pub fn devices_per_port(&self) -> u32 {
        match self {
            StorageBus::Ide | StorageBus::Floppy => 2,
            _ => 1,
        }
    }

    pub fn accepts(&self, device_type: DeviceType) -> bool {
        match self {
            StorageBus::Floppy => device_type == DeviceType::Floppy,
            _ => device_type != DeviceType::Floppy,
        }
    }
}

/// Policy for what `unregister` detaches and hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupMode {
    /// Detach everything, return only hard disks.
    #[default]
    DetachAllReturnHardDisksOnly,
    /// Detach everything, return every detached medium.
    DetachAll,
    /// Detach and return everything; the caller intends to delete it all.
    Full,
}

impl CleanupMode {
    pub fn returns(&self, device_type: DeviceType) -> bool {
        match self {
            CleanupMode::DetachAllReturnHardDisksOnly => device_type == DeviceType::HardDisk,
            CleanupMode::DetachAll | CleanupMode::Full => true,
        }
    }
}

/// Front-end the VM process is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    Gui,
    #[default]
    Headless,
    Separate,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Gui => "gui",
            LaunchMode::Headless => "headless",
            LaunchMode::Separate => "separate",
        }
    }
}

impl std::str::FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gui" => Ok(LaunchMode::Gui),
            "headless" => Ok(LaunchMode::Headless),
            "separate" => Ok(LaunchMode::Separate),
            other => Err(format!("unknown launch mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumVariant {
    /// Dynamically allocated image.
    #[default]
    Standard,
    /// Fully preallocated image.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsController {
    Null,
    VboxVga,
    #[default]
    Vmsvga,
    VboxSvga,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_mode_returns() {
        let mode = CleanupMode::DetachAllReturnHardDisksOnly;
        assert!(mode.returns(DeviceType::HardDisk));
        assert!(!mode.returns(DeviceType::Dvd));
        assert!(CleanupMode::DetachAll.returns(DeviceType::Dvd));
        assert!(CleanupMode::Full.returns(DeviceType::Floppy));
    }

    #[test]
    fn test_bus_geometry() {
        assert_eq!(StorageBus::Ide.port_count(), 2);
        assert_eq!(StorageBus::Ide.devices_per_port(), 2);
        assert_eq!(StorageBus::Sata.devices_per_port(), 1);
        assert!(StorageBus::Floppy.accepts(DeviceType::Floppy));
        assert!(!StorageBus::Sata.accepts(DeviceType::Floppy));
        assert!(StorageBus::Ide.accepts(DeviceType::Dvd));
    }

    #[test]
    fn test_launch_mode_parse() {
        assert_eq!("gui".parse::<LaunchMode>(), Ok(LaunchMode::Gui));
        assert_eq!(LaunchMode::default().as_str(), "headless");
        assert!("vnc".parse::<LaunchMode>().is_err());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&DeviceType::HardDisk).unwrap(),
            "\"hard-disk\""
        );
        assert_eq!(
            serde_json::from_str::<CleanupMode>("\"detach-all\"").unwrap(),
            CleanupMode::DetachAll
        );
        assert_eq!(serde_json::to_string(&LockMode::Shared).unwrap(), "\"shared\"");
    }
}
