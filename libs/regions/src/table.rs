//! Static region table.
//!
//! Lookups never fail: an unregistered code yields `DEFAULT_LABEL`.

use std::fmt;
use std::str::FromStr;

use crate::error::RegionError;

/// Label used for codes that are not in the table.
pub const DEFAULT_LABEL: &str = "🌍";

/// Name used for codes that are not in the table.
pub const DEFAULT_NAME: &str = "Unknown";

/// One row in the region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Two-letter code (upper case).
    pub code: &'static str,
    /// Display label (flag emoji).
    pub label: &'static str,
    /// English country name.
    pub name: &'static str,
}

const fn info(code: &'static str, label: &'static str, name: &'static str) -> RegionInfo {
    RegionInfo { code, label, name }
}

/// Supported egress regions, in pool order.
pub const REGIONS: &[RegionInfo] = &[
    info("AT", "🇦🇹", "Austria"),
    info("AU", "🇦🇺", "Australia"),
    info("BE", "🇧🇪", "Belgium"),
    info("BG", "🇧🇬", "Bulgaria"),
    info("CA", "🇨🇦", "Canada"),
    info("CH", "🇨🇭", "Switzerland"),
    info("CZ", "🇨🇿", "Czech Republic"),
    info("DE", "🇩🇪", "Germany"),
    info("DK", "🇩🇰", "Denmark"),
    info("EE", "🇪🇪", "Estonia"),
    info("ES", "🇪🇸", "Spain"),
    info("FI", "🇫🇮", "Finland"),
    info("FR", "🇫🇷", "France"),
    info("GB", "🇬🇧", "United Kingdom"),
    info("HR", "🇭🇷", "Croatia"),
    info("HU", "🇭🇺", "Hungary"),
    info("IE", "🇮🇪", "Ireland"),
    info("IN", "🇮🇳", "India"),
    info("IT", "🇮🇹", "Italy"),
    info("JP", "🇯🇵", "Japan"),
    info("LV", "🇱🇻", "Latvia"),
    info("NL", "🇳🇱", "Netherlands"),
    info("NO", "🇳🇴", "Norway"),
    info("PL", "🇵🇱", "Poland"),
    info("PT", "🇵🇹", "Portugal"),
    info("RO", "🇷🇴", "Romania"),
    info("RS", "🇷🇸", "Serbia"),
    info("SE", "🇸🇪", "Sweden"),
    info("SG", "🇸🇬", "Singapore"),
    info("SK", "🇸🇰", "Slovakia"),
    info("US", "🇺🇸", "United States"),
];

/// A two-letter region identifier, normalized to upper case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionCode([u8; 2]);

impl RegionCode {
    /// Parse a region code. Accepts any two ASCII letters, in any case.
    pub fn new(s: &str) -> Result<Self, RegionError> {
        match s.trim().as_bytes() {
            [a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                Ok(Self([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => Err(RegionError::InvalidCode(s.to_string())),
        }
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        // Both bytes are ASCII letters by construction.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }

    /// Display label for this region.
    pub fn label(&self) -> &'static str {
        label_for(self.as_str())
    }

    /// Country name for this region.
    pub fn name(&self) -> &'static str {
        name_for(self.as_str())
    }
}

impl FromStr for RegionCode {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lookup(code: &str) -> Option<&'static RegionInfo> {
    REGIONS.iter().find(|r| r.code == code)
}

/// Display label for a region code. Exact match only.
pub fn label_for(code: &str) -> &'static str {
    lookup(code).map(|r| r.label).unwrap_or(DEFAULT_LABEL)
}

/// Country name for a region code.
pub fn name_for(code: &str) -> &'static str {
    lookup(code).map(|r| r.name).unwrap_or(DEFAULT_NAME)
}

/// Whether the code is in the region table.
pub fn is_known(code: &RegionCode) -> bool {
    lookup(code.as_str()).is_some()
}

/// All table regions, in table order.
pub fn all_regions() -> Vec<RegionCode> {
    REGIONS
        .iter()
        .filter_map(|r| RegionCode::new(r.code).ok())
        .collect()
}
