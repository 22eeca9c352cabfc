//! Discovered peripherals and their DFU variant.

use std::fmt;

use uuid::Uuid;

use crate::protocol::constants::*;

/// Which bootloader protocol a peripheral speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DfuVariant {
    /// SDK 11 and older, unsigned packages.
    #[default]
    Legacy,
    /// SDK 12+, every part carries a signed init packet.
    ///
    /// Only service detection and the init packet requirement differ from
    /// `Legacy`: the session drives both with the same control point
    /// command set. The object-based (create/execute) transfer of SDK 12+
    /// bootloaders is not implemented.
    Secure,
}

impl DfuVariant {
    /// Pick the variant from advertised services.
    ///
    /// Secure wins when both are present. Legacy buttonless applications
    /// advertise the Heart Rate service instead of the DFU service.
    pub fn from_services(services: &[Uuid]) -> Option<Self> {
        if services.contains(&SECURE_DFU_SERVICE_UUID) {
            Some(DfuVariant::Secure)
        } else if services.contains(&LEGACY_DFU_SERVICE_UUID)
            || services.contains(&HEART_RATE_SERVICE_UUID)
        {
            Some(DfuVariant::Legacy)
        } else {
            None
        }
    }

    pub fn service_uuid(self) -> Uuid {
        match self {
            DfuVariant::Legacy => LEGACY_DFU_SERVICE_UUID,
            DfuVariant::Secure => SECURE_DFU_SERVICE_UUID,
        }
    }

    pub fn control_point_uuid(self) -> Uuid {
        match self {
            DfuVariant::Legacy => LEGACY_CONTROL_POINT_UUID,
            DfuVariant::Secure => SECURE_CONTROL_POINT_UUID,
        }
    }

    pub fn packet_uuid(self) -> Uuid {
        match self {
            DfuVariant::Legacy => LEGACY_PACKET_UUID,
            DfuVariant::Secure => SECURE_PACKET_UUID,
        }
    }

    pub fn requires_init_packet(self) -> bool {
        matches!(self, DfuVariant::Secure)
    }
}

impl fmt::Display for DfuVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuVariant::Legacy => write!(f, "Legacy DFU"),
            DfuVariant::Secure => write!(f, "Secure DFU"),
        }
    }
}

/// A peripheral found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRef {
    /// Platform identifier (address or OS handle).
    pub id: String,
    pub name: Option<String>,
    pub variant: DfuVariant,
    pub rssi: Option<i16>,
}

impl PeripheralRef {
    pub fn new(id: impl Into<String>, variant: DfuVariant) -> Self {
        Self {
            id: id.into(),
            name: None,
            variant,
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown device")
    }
}

impl fmt::Display for PeripheralRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.display_name(), self.id, self.variant)?;
        if let Some(rssi) = self.rssi {
            write!(f, " {rssi} dBm")?;
        }
        Ok(())
    }
}

/// Discovery list without duplicates, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredPeripherals {
    items: Vec<PeripheralRef>,
}

impl DiscoveredPeripherals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peripheral. A repeated advertisement refreshes name and RSSI of
    /// the existing entry and returns `false`.
    pub fn insert(&mut self, peripheral: PeripheralRef) -> bool {
        match self.items.iter_mut().find(|p| p.id == peripheral.id) {
            Some(existing) => {
                if peripheral.name.is_some() {
                    existing.name = peripheral.name;
                }
                if peripheral.rssi.is_some() {
                    existing.rssi = peripheral.rssi;
                }
                false
            }
            None => {
                self.items.push(peripheral);
                true
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&PeripheralRef> {
        self.items.get(index)
    }

    pub fn find(&self, id: &str) -> Option<&PeripheralRef> {
        self.items.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeripheralRef> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_from_services() {
        assert_eq!(
            DfuVariant::from_services(&[SECURE_DFU_SERVICE_UUID, LEGACY_DFU_SERVICE_UUID]),
            Some(DfuVariant::Secure)
        );
        assert_eq!(
            DfuVariant::from_services(&[HEART_RATE_SERVICE_UUID]),
            Some(DfuVariant::Legacy)
        );
        assert_eq!(DfuVariant::from_services(&[]), None);
    }

    #[test]
    fn test_variant_uuids() {
        assert_eq!(
            DfuVariant::Legacy.control_point_uuid().to_string(),
            "00001531-1212-efde-1523-785feabcd123"
        );
        assert_eq!(
            DfuVariant::Secure.service_uuid().to_string(),
            "0000fe59-0000-1000-8000-00805f9b34fb"
        );
        assert!(DfuVariant::Secure.requires_init_packet());
        assert!(!DfuVariant::Legacy.requires_init_packet());
    }

    #[test]
    fn test_discovered_deduplicates() {
        let mut list = DiscoveredPeripherals::new();
        assert!(list.insert(PeripheralRef::new("AA", DfuVariant::Legacy)));
        assert!(list.insert(PeripheralRef::new("BB", DfuVariant::Secure)));

        let mut again = PeripheralRef::new("AA", DfuVariant::Legacy).with_name("Sensor");
        again.rssi = Some(-40);
        assert!(!list.insert(again));

        assert_eq!(list.len(), 2);
        let first = list.get(0).unwrap();
        assert_eq!(first.display_name(), "Sensor");
        assert_eq!(first.rssi, Some(-40));
        assert_eq!(list.find("BB").unwrap().variant, DfuVariant::Secure);
    }

    #[test]
    fn test_display_name_fallback() {
        let p = PeripheralRef::new("AA", DfuVariant::Legacy);
        assert_eq!(p.to_string(), "Unknown device [AA] (Legacy DFU)");
    }
}
