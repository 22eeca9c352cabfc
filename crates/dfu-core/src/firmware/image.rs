//! Firmware image loading and validation.
//!
//! An image is loaded from a DFU zip package, a raw `.bin` file, or bytes in
//! memory. Every declared size and checksum is verified here, so an image
//! that exists at all is fit for transfer.

use std::fmt;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use super::crc::{crc16_ccitt, crc32};
use super::manifest::PackageManifest;
use crate::protocol::ProtocolError;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const MAX_PARTS: usize = u8::MAX as usize + 1;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid firmware format: {0}")]
    InvalidFormat(String),

    #[error("{part} {field} mismatch: declared {declared:#X}, computed {computed:#X}")]
    ChecksumMismatch {
        part: PartKind,
        field: &'static str,
        declared: u64,
        computed: u64,
    },

    #[error("Firmware image contains no data")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Target slot of a firmware part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartKind {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

impl PartKind {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(PartKind::SoftDevice),
            0x02 => Ok(PartKind::Bootloader),
            0x03 => Ok(PartKind::SoftDeviceBootloader),
            0x04 => Ok(PartKind::Application),
            other => Err(ProtocolError::UnknownImageType(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartKind::SoftDevice => write!(f, "softdevice"),
            PartKind::Bootloader => write!(f, "bootloader"),
            PartKind::SoftDeviceBootloader => write!(f, "softdevice+bootloader"),
            PartKind::Application => write!(f, "application"),
        }
    }
}

/// One binary to transfer.
#[derive(Debug, Clone)]
pub struct FirmwarePart {
    kind: PartKind,
    data: Vec<u8>,
    init_packet: Option<Vec<u8>>,
    crc: u32,
}

impl FirmwarePart {
    /// Create a part, computing its CRC over `data`.
    pub fn new(kind: PartKind, data: Vec<u8>) -> Self {
        let crc = crc32(&data);
        Self {
            kind,
            data,
            init_packet: None,
            crc,
        }
    }

    pub fn with_init_packet(mut self, init_packet: Vec<u8>) -> Self {
        self.init_packet = Some(init_packet);
        self
    }

    pub fn kind(&self) -> PartKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn init_packet(&self) -> Option<&[u8]> {
        self.init_packet.as_deref()
    }

    /// CRC32 of the payload.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Where to load an image from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// `.zip` package or raw `.bin` application.
    Path(PathBuf),
    /// Package or raw binary already in memory.
    Bytes { name: String, data: Vec<u8> },
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

/// Validated, immutable firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    id: String,
    parts: Vec<FirmwarePart>,
}

impl FirmwareImage {
    /// Load and validate an image.
    pub fn load(source: impl Into<ImageSource>) -> Result<Self, ImageError> {
        match source.into() {
            ImageSource::Path(path) => {
                let id = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let is_zip = path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
                let is_bin = path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));

                info!(path = %path.display(), "Loading firmware");
                if is_zip {
                    let file = std::fs::File::open(&path)?;
                    Self::from_package(id, file)
                } else if is_bin {
                    Self::from_bin(id, std::fs::read(&path)?)
                } else {
                    Err(ImageError::InvalidFormat(format!(
                        "unsupported file type: {}",
                        path.display()
                    )))
                }
            }
            ImageSource::Bytes { name, data } => {
                if data.starts_with(ZIP_MAGIC) {
                    Self::from_package(name, Cursor::new(data))
                } else {
                    Self::from_bin(name, data)
                }
            }
        }
    }

    /// Raw binary, sent as a single application part.
    pub fn from_bin(id: impl Into<String>, data: Vec<u8>) -> Result<Self, ImageError> {
        Self::from_parts(id, vec![FirmwarePart::new(PartKind::Application, data)])
    }

    /// Build an image from parts. Parts keep the given order.
    pub fn from_parts(
        id: impl Into<String>,
        parts: Vec<FirmwarePart>,
    ) -> Result<Self, ImageError> {
        if parts.is_empty() || parts.iter().any(FirmwarePart::is_empty) {
            return Err(ImageError::Empty);
        }
        // Parts are addressed by a one-byte index on the wire.
        if parts.len() > MAX_PARTS {
            return Err(ImageError::InvalidFormat(format!(
                "{} parts, at most {MAX_PARTS} supported",
                parts.len()
            )));
        }
        for part in &parts {
            let init_len = part.init_packet().map_or(0, <[u8]>::len);
            if u32::try_from(part.len()).is_err() || u32::try_from(init_len).is_err() {
                return Err(ImageError::InvalidFormat(format!(
                    "{} part exceeds 4 GiB",
                    part.kind()
                )));
            }
        }
        Ok(Self {
            id: id.into(),
            parts,
        })
    }

    /// Read a zip package: manifest first, then every referenced file.
    pub fn from_package<R: Read + Seek>(
        id: impl Into<String>,
        reader: R,
    ) -> Result<Self, ImageError> {
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|e| ImageError::InvalidFormat(format!("not a zip package: {e}")))?;

        let manifest_json = read_entry(&mut archive, "manifest.json")?;
        let manifest_json = String::from_utf8(manifest_json)
            .map_err(|_| ImageError::InvalidFormat("manifest.json is not UTF-8".into()))?;
        let manifest = PackageManifest::parse(&manifest_json)?;

        let entries = manifest.entries();
        if entries.is_empty() {
            return Err(ImageError::InvalidFormat(
                "manifest.json declares no firmware".into(),
            ));
        }

        let mut parts = Vec::with_capacity(entries.len());
        for (kind, entry) in entries {
            let data = read_entry(&mut archive, &entry.bin_file)?;
            let init_packet = entry
                .dat_file
                .as_deref()
                .map(|name| read_entry(&mut archive, name))
                .transpose()?;

            let mut part = FirmwarePart::new(kind, data);
            if let Some(size) = entry.size {
                check(kind, "size", size, part.len() as u64)?;
            }
            if let Some(crc) = entry.crc32 {
                check(kind, "crc32", crc as u64, part.crc() as u64)?;
            }
            if let Some(crc16) = entry
                .init_packet_data
                .as_ref()
                .and_then(|d| d.firmware_crc16)
            {
                check(kind, "crc16", crc16 as u64, crc16_ccitt(part.data()) as u64)?;
            }
            if let Some(init) = init_packet {
                part = part.with_init_packet(init);
            }

            debug!(
                kind = %kind,
                size = part.len(),
                crc = %format!("{:08X}", part.crc()),
                "Loaded part"
            );
            parts.push(part);
        }

        Self::from_parts(id, parts)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parts(&self) -> &[FirmwarePart] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Payload bytes across all parts (init packets excluded).
    pub fn total_size(&self) -> usize {
        self.parts.iter().map(FirmwarePart::len).sum()
    }

    /// Whether every part carries an init packet.
    pub fn has_init_packets(&self) -> bool {
        self.parts.iter().all(|p| p.init_packet().is_some())
    }
}

fn check(part: PartKind, field: &'static str, declared: u64, computed: u64) -> Result<(), ImageError> {
    if declared == computed {
        Ok(())
    } else {
        Err(ImageError::ChecksumMismatch {
            part,
            field,
            declared,
            computed,
        })
    }
}

fn read_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, ImageError> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| ImageError::InvalidFormat(format!("missing {name} in package")))?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::FileOptions;

    const APP: &[u8] = &[0x01, 0x02, 0x03, 0x04];

    fn package(manifest: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        zip.start_file("manifest.json", options).unwrap();
        zip.write_all(manifest.as_bytes()).unwrap();
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn load_bytes(data: Vec<u8>) -> Result<FirmwareImage, ImageError> {
        FirmwareImage::load(ImageSource::Bytes {
            name: "test.zip".into(),
            data,
        })
    }

    #[test]
    fn test_load_package_with_declared_checksums() {
        let manifest = format!(
            r#"{{ "manifest": {{ "application": {{
                "bin_file": "app.bin", "dat_file": "app.dat",
                "size": 4, "crc32": {},
                "init_packet_data": {{ "firmware_crc16": {} }}
            }} }} }}"#,
            crc32(APP),
            crc16_ccitt(APP)
        );
        let data = package(&manifest, &[("app.bin", APP), ("app.dat", &[0xAA, 0xBB])]);

        let image = load_bytes(data).unwrap();
        assert_eq!(image.part_count(), 1);
        let part = &image.parts()[0];
        assert_eq!(part.kind(), PartKind::Application);
        assert_eq!(part.data(), APP);
        assert_eq!(part.init_packet(), Some(&[0xAA, 0xBB][..]));
        assert_eq!(part.crc(), crc32(APP));
        assert!(image.has_init_packets());
    }

    #[test]
    fn test_tampered_crc_rejected() {
        let manifest = format!(
            r#"{{ "manifest": {{ "application": {{ "bin_file": "app.bin", "crc32": {} }} }} }}"#,
            crc32(APP) ^ 1
        );
        let data = package(&manifest, &[("app.bin", APP)]);

        assert!(matches!(
            load_bytes(data),
            Err(ImageError::ChecksumMismatch { field: "crc32", .. })
        ));
    }

    #[test]
    fn test_declared_size_mismatch() {
        let manifest = r#"{ "manifest": { "application": { "bin_file": "app.bin", "size": 5 } } }"#;
        let data = package(manifest, &[("app.bin", APP)]);

        assert!(matches!(
            load_bytes(data),
            Err(ImageError::ChecksumMismatch {
                field: "size",
                declared: 5,
                computed: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_legacy_crc16_mismatch() {
        let manifest = r#"{ "manifest": { "application": {
            "bin_file": "app.bin",
            "init_packet_data": { "firmware_crc16": 1 }
        } } }"#;
        let data = package(manifest, &[("app.bin", APP)]);

        assert!(matches!(
            load_bytes(data),
            Err(ImageError::ChecksumMismatch { field: "crc16", .. })
        ));
    }

    #[test]
    fn test_missing_bin_file() {
        let manifest = r#"{ "manifest": { "application": { "bin_file": "app.bin" } } }"#;
        let data = package(manifest, &[]);

        assert!(matches!(load_bytes(data), Err(ImageError::InvalidFormat(_))));
    }

    #[test]
    fn test_manifest_without_firmware() {
        let data = package(r#"{ "manifest": {} }"#, &[]);
        assert!(matches!(load_bytes(data), Err(ImageError::InvalidFormat(_))));
    }

    #[test]
    fn test_two_part_package_order() {
        let manifest = r#"{ "manifest": {
            "application": { "bin_file": "app.bin" },
            "softdevice_bootloader": { "bin_file": "sdbl.bin" }
        } }"#;
        let data = package(manifest, &[("app.bin", APP), ("sdbl.bin", &[9; 16])]);

        let image = load_bytes(data).unwrap();
        assert_eq!(image.parts()[0].kind(), PartKind::SoftDeviceBootloader);
        assert_eq!(image.parts()[1].kind(), PartKind::Application);
        assert_eq!(image.total_size(), 20);
        assert!(!image.has_init_packets());
    }

    #[test]
    fn test_raw_bin_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, APP).unwrap();

        let image = FirmwareImage::load(path.as_path()).unwrap();
        assert_eq!(image.id(), "app.bin");
        assert_eq!(image.parts()[0].kind(), PartKind::Application);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.hex");
        std::fs::write(&path, APP).unwrap();

        assert!(matches!(
            FirmwareImage::load(path),
            Err(ImageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(
            FirmwareImage::from_bin("empty", Vec::new()),
            Err(ImageError::Empty)
        ));
        assert!(matches!(
            FirmwareImage::from_parts("none", Vec::new()),
            Err(ImageError::Empty)
        ));
    }

    #[test]
    fn test_part_count_fits_wire_index() {
        let parts = |n: usize| -> Vec<FirmwarePart> {
            (0..n)
                .map(|_| FirmwarePart::new(PartKind::Application, vec![0xA5; 4]))
                .collect()
        };

        assert_eq!(
            FirmwareImage::from_parts("max", parts(256)).unwrap().part_count(),
            256
        );
        assert!(matches!(
            FirmwareImage::from_parts("too many", parts(257)),
            Err(ImageError::InvalidFormat(_))
        ));
    }
}
