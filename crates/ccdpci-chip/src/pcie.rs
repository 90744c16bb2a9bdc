//! PCI identifiers and board limits.

/// Motorola vendor ID, carried by the ARC PCI interface (DSP56301 bridge).
pub const MOTOROLA_VENDOR_ID: u16 = 0x1057;

/// AMCC vendor ID, carried by the Roper/Photometrics PVCAM interface (S5933).
pub const AMCC_VENDOR_ID: u16 = 0x10E8;

/// Device IDs.
pub mod device_id {
    /// ARC Gen III PCI interface board (`lspci: 1057:1801`).
    pub const ARC_PCI: u16 = 0x1801;
    /// PVCAM PCI interface board (`lspci: 10e8:81e6`).
    pub const PVCAM_PCI: u16 = 0x81E6;
}

/// Maximum number of ARC boards one host binds.
pub const ARC_MAX_BOARDS: usize = 2;

/// Maximum number of PVCAM cameras one host binds.
pub const PVCAM_MAX_BOARDS: usize = 12;

/// PVCAM camera number is the low nibble of the minor number.
pub const PVCAM_MINOR_MASK: u32 = 0xF;

/// Board family identified from the PCI ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardVariant {
    /// ARC DSP controller interface.
    Arc,
    /// PVCAM camera interface.
    Pvcam,
}

impl BoardVariant {
    /// Identify the board family from a vendor/device pair.
    #[must_use]
    pub const fn from_ids(vendor: u16, device: u16) -> Option<Self> {
        match (vendor, device) {
            (MOTOROLA_VENDOR_ID, device_id::ARC_PCI) => Some(Self::Arc),
            (AMCC_VENDOR_ID, device_id::PVCAM_PCI) => Some(Self::Pvcam),
            _ => None,
        }
    }

    /// Vendor ID for this family.
    #[must_use]
    pub const fn vendor_id(self) -> u16 {
        match self {
            Self::Arc => MOTOROLA_VENDOR_ID,
            Self::Pvcam => AMCC_VENDOR_ID,
        }
    }

    /// Device ID for this family.
    #[must_use]
    pub const fn device_id(self) -> u16 {
        match self {
            Self::Arc => device_id::ARC_PCI,
            Self::Pvcam => device_id::PVCAM_PCI,
        }
    }

    /// How many boards of this family a host binds at most.
    #[must_use]
    pub const fn max_boards(self) -> usize {
        match self {
            Self::Arc => ARC_MAX_BOARDS,
            Self::Pvcam => PVCAM_MAX_BOARDS,
        }
    }

    /// Format a `vendor:device` string for use with `lspci -d`.
    #[must_use]
    pub fn lspci_filter(self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id(), self.device_id())
    }
}

impl std::fmt::Display for BoardVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arc => f.write_str("ARC"),
            Self::Pvcam => f.write_str("PVCAM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_round_trip_through_ids() {
        for v in [BoardVariant::Arc, BoardVariant::Pvcam] {
            assert_eq!(BoardVariant::from_ids(v.vendor_id(), v.device_id()), Some(v));
        }
        assert_eq!(BoardVariant::from_ids(0x1057, 0x81E6), None);
        assert_eq!(BoardVariant::Arc.lspci_filter(), "1057:1801");
    }
}
