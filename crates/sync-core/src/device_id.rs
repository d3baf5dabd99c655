//! DeviceId: identifies one client replica in vector clocks and live messages.
//!
//! New devices get a 16-character lowercase hex ID. UUIDs are also accepted so
//! clients that were already issued a UUID keep the same vector clock key.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Invalid device ID format: expected 16 hex chars or UUID")]
    InvalidFormat,
}

/// A device (client replica) identifier.
///
/// # Examples
/// ```
/// use sync_core::DeviceId;
///
/// let device = DeviceId::generate();
/// assert_eq!(device.as_str().len(), 16);
///
/// let parsed: DeviceId = "A1B2C3D4E5F67890".parse().unwrap();
/// assert_eq!(parsed.as_str(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a new random device ID. Never all zeros.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(format!("{:016x}", id));
            }
        }
    }

    /// The vector clock key for this device.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self(s.to_ascii_lowercase()));
        }

        // UUID: 36 chars, dashes at 8/13/18/23, hex everywhere else
        if s.len() == 36 {
            let well_formed = s.char_indices().all(|(i, c)| match i {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_hexdigit(),
            });
            if well_formed {
                return Ok(Self(s.to_ascii_lowercase()));
            }
        }

        Err(DeviceIdError::InvalidFormat)
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
