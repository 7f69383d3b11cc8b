//! Device identity
//!
//! A device only ever identifies itself through what it asks for: a MAC
//! address embedded in a filename or header, a vendor/model token from its
//! user agent, or failing that the raw name of the file it requested. This
//! module turns those inputs into a normalised [`DeviceIdentifier`] so that
//! two differently formatted spellings of the same identity compare equal.

use crate::error::Error;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Key prefix for vendor/model token identifiers
const TOKEN_PREFIX: &str = "token:";

/// Key prefix for raw filename identifiers
const FILE_PREFIX: &str = "file:";

/// Separated form: `00:11:22:aa:bb:cc` or `00-11-22-AA-BB-CC`
static SEPARATED_MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^0-9a-f])([0-9a-f]{2}(?:[:-][0-9a-f]{2}){5})(?:$|[^0-9a-f:-])")
        .expect("static regex")
});

/// Bare form: `001122aabbcc`, as found in `SEP001122AABBCC.cnf.xml`
static BARE_MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^0-9a-f])([0-9a-f]{12})(?:$|[^0-9a-f])").expect("static regex")
});

/// A 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Find the first MAC address embedded in arbitrary text
    ///
    /// Separated spellings win over bare 12-digit runs, and a hex run longer
    /// than 12 digits is never split into a MAC.
    pub fn find_in(text: &str) -> Option<Self> {
        if let Some(found) = SEPARATED_MAC
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            return Some(found);
        }
        BARE_MAC
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Render without separators, e.g. `001122AABBCC`
    pub fn to_bare(&self, uppercase: bool) -> String {
        let bare: String = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        if uppercase {
            bare.to_uppercase()
        } else {
            bare
        }
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || Error::InvalidMac(s.to_string());

        let groups: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else if s.contains('.') {
            // Cisco dotted notation: 0011.22aa.bbcc
            let parts: Vec<&str> = s.split('.').collect();
            if parts.len() != 3 || parts.iter().any(|p| p.len() != 4) {
                return Err(invalid());
            }
            return parse_bare(&parts.concat()).ok_or_else(invalid);
        } else {
            return parse_bare(s).ok_or_else(invalid);
        };

        if groups.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, group) in octets.iter_mut().zip(&groups) {
            if group.is_empty() || group.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

fn parse_bare(s: &str) -> Option<MacAddress> {
    if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut octets = [0u8; 6];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(MacAddress(octets))
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Normalize MAC address to lowercase with colons
///
/// Strings that do not parse as a MAC are returned lowercased with `-`
/// replaced by `:`, so the function can be used on prefixes too.
pub fn normalize_mac(mac: &str) -> String {
    match mac.parse::<MacAddress>() {
        Ok(parsed) => parsed.to_string(),
        Err(_) => mac.trim().to_lowercase().replace('-', ":"),
    }
}

/// The normalised key a device is known by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DeviceIdentifier {
    /// Hardware address, always lowercase colon-separated
    Mac(MacAddress),
    /// Vendor/model token, lowercase with single spaces
    Token(String),
    /// Requested filename when nothing more structured is available
    Filename(String),
}

impl DeviceIdentifier {
    pub fn mac(mac: MacAddress) -> Self {
        DeviceIdentifier::Mac(mac)
    }

    /// Build a token identifier, normalising case and whitespace
    pub fn token(raw: &str) -> Result<Self, Error> {
        let normalized = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if normalized.is_empty() {
            return Err(Error::InvalidIdentifier("empty token".to_string()));
        }
        Ok(DeviceIdentifier::Token(normalized))
    }

    /// Build a filename identifier, normalising case and path separators
    pub fn filename(raw: &str) -> Result<Self, Error> {
        let normalized = normalize_path(raw);
        if normalized.is_empty() {
            return Err(Error::InvalidIdentifier("empty filename".to_string()));
        }
        Ok(DeviceIdentifier::Filename(normalized))
    }

    pub fn as_mac(&self) -> Option<&MacAddress> {
        match self {
            DeviceIdentifier::Mac(mac) => Some(mac),
            _ => None,
        }
    }

    /// Stable string key, used by stores and logs
    pub fn key(&self) -> String {
        self.to_string()
    }
}

/// Lowercase, use `/` as the only separator, drop leading and repeated `/`
pub fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
        .to_lowercase()
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentifier::Mac(mac) => write!(f, "{}", mac),
            DeviceIdentifier::Token(token) => write!(f, "{}{}", TOKEN_PREFIX, token),
            DeviceIdentifier::Filename(name) => write!(f, "{}{}", FILE_PREFIX, name),
        }
    }
}

impl FromStr for DeviceIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(token) = s.strip_prefix(TOKEN_PREFIX) {
            return DeviceIdentifier::token(token);
        }
        if let Some(name) = s.strip_prefix(FILE_PREFIX) {
            return DeviceIdentifier::filename(name);
        }
        s.parse::<MacAddress>()
            .map(DeviceIdentifier::Mac)
            .map_err(|_| Error::InvalidIdentifier(s.to_string()))
    }
}

impl From<DeviceIdentifier> for String {
    fn from(id: DeviceIdentifier) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for DeviceIdentifier {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for DeviceIdentifier {
    fn from(mac: MacAddress) -> Self {
        DeviceIdentifier::Mac(mac)
    }
}
