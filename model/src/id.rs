use std::{fmt, str::FromStr};

use anyhow::bail;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use uuid::Uuid;

/// Global 128-bit identifier of a building or address feature.
///
/// Canonical text is the lower-case hyphenated 8-4-4-4-12 form. Every value of
/// this type went through [`GersId::normalize`], so comparing two of them is
/// always comparing canonical forms.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay)]
pub struct GersId(Uuid);

impl GersId {
    /// Reduces `raw` to its hex digits and accepts it when exactly 32 remain.
    ///
    /// Both the compact (`0f3c...`) and hyphenated forms are accepted in any
    /// case. Anything else yields `None`.
    pub fn normalize(raw: &str) -> Option<Self> {
        let hex: String = raw.chars().filter(|x| x.is_ascii_hexdigit()).collect();
        if hex.len() != 32 {
            return None;
        }

        u128::from_str_radix(&hex, 16)
            .ok()
            .map(|x| Self(Uuid::from_u128(x)))
    }

    pub fn validate(raw: &str) -> bool {
        Self::normalize(raw).is_some()
    }

    /// 32 lower-case hex characters, no separators.
    pub fn compact(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for GersId {
    fn from(x: Uuid) -> Self {
        Self(x)
    }
}

impl fmt::Display for GersId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for GersId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GersId({self})")
    }
}

impl FromStr for GersId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::normalize(s) {
            Some(x) => Ok(x),
            None => bail!("invalid identifier: {s}"),
        }
    }
}
