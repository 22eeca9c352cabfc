//! Firmware packages and part payloads.

pub mod chunk;
pub mod crc;
pub mod image;
pub mod manifest;

pub use chunk::ChunkState;
pub use crc::{crc16_ccitt, crc32};
pub use image::{FirmwareImage, FirmwarePart, ImageError, ImageSource, PartKind};
pub use manifest::PackageManifest;
