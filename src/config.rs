use std::{fs::read_to_string, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub snapshot: SnapshotConfig,
    pub resolver: ResolverConfig,
    pub placement: PlacementConfig,
    pub linker: LinkerConfig,
    pub routing: RoutingConfig,
}

impl Config {
    /// A missing file is not an error: every setting has a default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = read_to_string(path)?;
        serde_yaml::from_str(&text).with_context(|| format!("invalid config: {}", path.display()))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StoreConfig {
    Local {
        #[serde(default = "default_dir")]
        dir: String,
    },
    Rest(RestConfig),
}

fn default_dir() -> String {
    "data".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Local { dir: default_dir() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub url: String,
    /// Name of the environment variable holding the service key.
    pub key_env: String,
    pub timeout_secs: u64,
    pub functions: RpcFunctions,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_env: "SUPABASE_SERVICE_ROLE_KEY".to_string(),
            timeout_secs: 60,
            functions: RpcFunctions::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RpcFunctions {
    pub gold_addresses: String,
    pub gold_buildings: String,
    pub unresolved_addresses: String,
    pub link_candidates: String,
    pub buildings_near: String,
    pub write_building_ids: String,
}

impl Default for RpcFunctions {
    fn default() -> Self {
        Self {
            gold_addresses: "get_gold_addresses_in_polygon_geojson".to_string(),
            gold_buildings: "get_gold_buildings_in_polygon_geojson".to_string(),
            unresolved_addresses: "get_addresses_missing_building".to_string(),
            link_candidates: "match_addresses_to_buildings".to_string(),
            buildings_near: "get_buildings_near".to_string(),
            write_building_ids: "write_address_building_ids".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub limit_buildings: u32,
    pub limit_addresses: u32,
    pub limit_roads: u32,
    pub include_roads: bool,
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 25,
            limit_buildings: 5000,
            limit_addresses: 5000,
            limit_roads: 2000,
            include_roads: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Authoritative rows needed before the fallback is skipped.
    pub gold_threshold: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { gold_threshold: 10 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub setback_m: f64,
    pub neighbor_radius_m: f64,
    pub neighbor_count: usize,
    pub spacing_ratio: f64,
    pub max_width_m: f64,
    pub base_width_m: f64,
    pub min_scale: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            setback_m: 10.0,
            neighbor_radius_m: 50.0,
            neighbor_count: 3,
            spacing_ratio: 0.7,
            max_width_m: 12.0,
            base_width_m: 10.0,
            min_scale: 0.1,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    pub write_batch: usize,
    /// How close a catalog address must be to count as the same point.
    pub direct_match_radius_m: f64,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            write_batch: 1000,
            direct_match_radius_m: 1.5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub walking_speed_kmh: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            walking_speed_kmh: 5.0,
        }
    }
}
