use geo::Point;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::GersId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressSource {
    Authoritative,
    Merged,
    Snapshot,
    BulkImport,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

impl AddressComponents {
    pub fn number(&self) -> Option<&str> {
        [self.house_number.as_deref(), self.street_number.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|x| !x.is_empty())
    }

    pub fn street(&self) -> Option<&str> {
        self.street_name
            .as_deref()
            .map(str::trim)
            .filter(|x| !x.is_empty())
    }

    /// `"<unit>-<number> <street>, <locality>, <region> <postal>"`, skipping
    /// whatever is missing.
    pub fn format(&self) -> String {
        let mut line = String::new();
        if let Some(x) = self.unit.as_deref().filter(|x| !x.trim().is_empty()) {
            line.push_str(x.trim());
            line.push('-');
        }
        if let Some(x) = self.number() {
            line.push_str(x);
        }
        if let Some(x) = self.street() {
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(x);
        }

        let mut output = line;
        if let Some(x) = self.locality.as_deref().filter(|x| !x.is_empty()) {
            if !output.is_empty() {
                output.push_str(", ");
            }
            output.push_str(x);
        }

        let tail = [self.region.as_deref(), self.postal_code.as_deref()]
            .into_iter()
            .flatten()
            .filter(|x| !x.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !tail.is_empty() {
            if !output.is_empty() {
                output.push_str(", ");
            }
            output.push_str(&tail);
        }

        output
    }
}

/// Walking-order fields stamped by the route sequencer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequencing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk_time_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub formatted: String,
    #[serde(flatten)]
    pub components: AddressComponents,
    pub point: Point,
    pub source: AddressSource,
    /// Key of the row in the dataset it came from, used for dedupe before the
    /// address is linked to a building.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    /// The address feature's own global identifier, when the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gers_id: Option<GersId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_id: Option<GersId>,
    /// Textual building reference kept during the identifier migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_building_ref: Option<String>,
    #[serde(default)]
    pub sequencing: Sequencing,
}

impl AddressRecord {
    pub fn new(
        campaign_id: Option<Uuid>,
        components: AddressComponents,
        point: Point,
        source: AddressSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            formatted: components.format(),
            components,
            point,
            source,
            source_key: None,
            gers_id: None,
            building_id: None,
            legacy_building_ref: None,
            sequencing: Sequencing::default(),
        }
    }

    /// Lower-cased `(house_number, street_name)`, or `None` when either half
    /// is missing.
    pub fn merge_key(&self) -> Option<(String, String)> {
        Some((
            self.components.number()?.to_lowercase(),
            self.components.street()?.to_lowercase(),
        ))
    }

    /// The key the row is upserted on: the building once linked, the source
    /// key (or formatted text) before that.
    pub fn conflict_key(&self) -> ConflictKey {
        match self.building_id {
            Some(x) => ConflictKey::Building(self.campaign_id, x),
            None => self.unlinked_key(),
        }
    }

    pub fn unlinked_key(&self) -> ConflictKey {
        match &self.source_key {
            Some(x) => ConflictKey::External(self.campaign_id, x.clone()),
            None => ConflictKey::Formatted(self.campaign_id, self.formatted.to_lowercase()),
        }
    }
}

/// Natural key an address is upserted on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConflictKey {
    Building(Option<Uuid>, GersId),
    External(Option<Uuid>, String),
    Formatted(Option<Uuid>, String),
}

/// Canadian codes become `A1A 1A1`; anything else is trimmed and upper-cased.
pub fn normalize_postal_code(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(|x| !x.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if compact.is_empty() {
        return None;
    }

    let chars: Vec<char> = compact.chars().collect();
    let canadian = chars.len() == 6
        && chars
            .iter()
            .enumerate()
            .all(|(i, x)| if i % 2 == 0 { x.is_ascii_alphabetic() } else { x.is_ascii_digit() });
    if canadian {
        Some(format!("{} {}", &compact[..3], &compact[3..]))
    } else {
        Some(raw.trim().to_uppercase())
    }
}
