//! `manifest.json` of a DFU zip package.
//!
//! Accepts the layout produced by nrfutil:
//!
//! ```json
//! { "manifest": {
//!     "softdevice_bootloader": { "bin_file": "sd_bl.bin", "dat_file": "sd_bl.dat" },
//!     "application": {
//!         "bin_file": "app.bin", "dat_file": "app.dat",
//!         "init_packet_data": { "firmware_crc16": 18974 }
//!     }
//! } }
//! ```
//!
//! Each entry may additionally declare `size` and `crc32`, which are checked
//! against the payload when the image is loaded.

use serde::Deserialize;

use super::image::{ImageError, PartKind};

#[derive(Debug, Deserialize)]
pub struct PackageManifest {
    pub manifest: ManifestBody,
}

#[derive(Debug, Default, Deserialize)]
pub struct ManifestBody {
    #[serde(default)]
    pub softdevice_bootloader: Option<ManifestEntry>,
    #[serde(default)]
    pub softdevice: Option<ManifestEntry>,
    #[serde(default)]
    pub bootloader: Option<ManifestEntry>,
    #[serde(default)]
    pub application: Option<ManifestEntry>,
    #[serde(default)]
    pub dfu_version: Option<f32>,
}

/// One binary in the package.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub bin_file: String,
    #[serde(default)]
    pub dat_file: Option<String>,
    #[serde(default)]
    pub init_packet_data: Option<InitPacketData>,
    /// Declared payload size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Declared CRC32 of the payload.
    #[serde(default)]
    pub crc32: Option<u32>,
}

/// Legacy init packet fields. Only the CRC is checked.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitPacketData {
    #[serde(default)]
    pub application_version: Option<u32>,
    #[serde(default)]
    pub device_revision: Option<u16>,
    #[serde(default)]
    pub device_type: Option<u16>,
    #[serde(default)]
    pub firmware_crc16: Option<u16>,
}

impl PackageManifest {
    pub fn parse(json: &str) -> Result<Self, ImageError> {
        serde_json::from_str(json)
            .map_err(|e| ImageError::InvalidFormat(format!("manifest.json: {e}")))
    }

    /// Entries in transfer order: system parts first, application last.
    pub fn entries(&self) -> Vec<(PartKind, &ManifestEntry)> {
        let body = &self.manifest;
        [
            (PartKind::SoftDeviceBootloader, body.softdevice_bootloader.as_ref()),
            (PartKind::SoftDevice, body.softdevice.as_ref()),
            (PartKind::Bootloader, body.bootloader.as_ref()),
            (PartKind::Application, body.application.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, entry)| entry.map(|e| (kind, e)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_order() {
        let manifest = PackageManifest::parse(
            r#"{ "manifest": {
                "application": { "bin_file": "app.bin" },
                "softdevice_bootloader": { "bin_file": "sdbl.bin", "dat_file": "sdbl.dat" }
            } }"#,
        )
        .unwrap();

        let kinds: Vec<_> = manifest.entries().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![PartKind::SoftDeviceBootloader, PartKind::Application]
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let manifest = PackageManifest::parse(
            r#"{ "manifest": {
                "application": {
                    "bin_file": "app.bin",
                    "dat_file": "app.dat",
                    "init_packet_data": { "firmware_crc16": 18974, "softdevice_req": [182] }
                },
                "dfu_version": 0.5
            } }"#,
        )
        .unwrap();

        let app = manifest.manifest.application.unwrap();
        assert_eq!(app.dat_file.as_deref(), Some("app.dat"));
        assert_eq!(app.init_packet_data.unwrap().firmware_crc16, Some(18974));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            PackageManifest::parse("{ invalid json }"),
            Err(ImageError::InvalidFormat(_))
        ));
    }
}
