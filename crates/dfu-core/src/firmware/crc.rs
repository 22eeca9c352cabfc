//! Checksums used by firmware packages.

/// CRC32 (IEEE) of a part payload, as reported by the bootloader.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC16-CCITT (init 0xFFFF) as written by nrfutil into legacy manifests.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc = (crc >> 8) | ((crc & 0xFF) << 8);
        crc ^= byte as u16;
        crc ^= (crc & 0xFF) >> 4;
        crc ^= (crc << 8) << 4;
        crc ^= ((crc & 0xFF) << 4) << 1;
    }

    crc
}
