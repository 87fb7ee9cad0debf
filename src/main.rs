use std::{
    fs::{read_to_string, write},
    path::PathBuf,
    sync::Arc,
};

use _model::geojson::{read_polygon, FeatureCollection};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::{
    bridge::{import_bridge, repair_bridged, BridgeImport, BridgeRepair},
    config::{Config, StoreConfig},
    import::{import_addresses, import_gold, BulkImport, GoldImport},
    linker::link_unresolved,
    placement::place_all,
    plan::{build_plan, PlanRequest},
    resolver::{snapshot::HttpSnapshot, ResolveRequest, Resolver},
    sequencer::sequence,
    store::{Backend, LocalStore, RestClient, WriteMode},
};

mod bridge;
mod config;
mod error;
mod import;
mod linker;
mod placement;
mod plan;
mod resolver;
mod sequencer;
mod store;
mod utils;

#[derive(Debug, Parser)]
#[command(version, about = "Addresses, buildings and walking routes for a drawn area")]
struct Cli {
    #[arg(long, default_value = "doorstep.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Resolve addresses and buildings inside a GeoJSON polygon.
    Resolve {
        #[arg(long)]
        polygon: PathBuf,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        campaign: Uuid,
        /// Upsert the result into the campaign.
        #[arg(long)]
        persist: bool,
    },
    /// Load cleaned municipal rows (NDJSON, optionally .zst).
    Import {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        campaign: Uuid,
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Load authoritative municipal addresses and building footprints.
    ImportGold {
        #[arg(long, required_unless_present = "buildings")]
        addresses: Option<PathBuf>,
        #[arg(long)]
        buildings: Option<PathBuf>,
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Give unlinked addresses a building.
    Link {
        #[arg(long)]
        campaign: Option<Uuid>,
        /// Also fill the legacy building column.
        #[arg(long)]
        double_write: bool,
    },
    /// Orient and size every building of a campaign.
    Place {
        #[arg(long)]
        campaign: Uuid,
        /// GeoJSON feature collection of road lines.
        #[arg(long)]
        roads: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Build a walking plan for a campaign.
    Sequence {
        #[arg(long)]
        campaign: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        workspace: Option<Uuid>,
        #[arg(long)]
        assignee: Option<Uuid>,
        #[arg(long)]
        save: bool,
    },
    /// Import an upstream identifier bridge file (JSON lines, optionally .zst).
    BridgeImport {
        #[arg(long)]
        release: NaiveDate,
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Rewrite building ids that a newer release replaced.
    BridgeRepair {
        #[arg(long)]
        campaign: Option<Uuid>,
        #[arg(long)]
        double_write: bool,
    },
}

fn write_mode(double_write: bool) -> WriteMode {
    if double_write {
        WriteMode::DoubleWrite
    } else {
        WriteMode::Canonical
    }
}

fn print<T: Serialize>(x: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(x)?);
    Ok(())
}

fn run<S: Backend>(store: &S, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Resolve {
            polygon,
            region,
            campaign,
            persist,
        } => {
            let polygon = read_polygon(&read_to_string(&polygon)?)
                .with_context(|| format!("failed to read {}", polygon.display()))?;
            let request = ResolveRequest {
                polygon,
                region,
                campaign_id: Some(campaign),
            };
            let snapshot = Arc::new(HttpSnapshot::new(&config.snapshot));
            let result = Resolver::tiered(
                store,
                snapshot,
                config.resolver.gold_threshold,
                config.snapshot.clone(),
            )
            .resolve(&request)?;

            if persist {
                let mut buildings = result.buildings.clone();
                for x in &mut buildings {
                    x.campaign_id = Some(campaign);
                }
                store.upsert_buildings(&buildings)?;
                store.upsert_addresses(&result.addresses)?;
                info!(
                    addresses = result.addresses.len(),
                    buildings = buildings.len(),
                    "persisted resolution"
                );
            }
            print(&result)
        }
        Command::Import {
            input,
            campaign,
            batch,
        } => print(&import_addresses(
            store,
            &BulkImport {
                input,
                campaign_id: campaign,
                batch,
            },
        )?),
        Command::ImportGold {
            addresses,
            buildings,
            batch,
        } => print(&import_gold(
            store,
            &GoldImport {
                addresses,
                buildings,
                batch,
            },
        )?),
        Command::Link {
            campaign,
            double_write,
        } => print(&link_unresolved(
            store,
            campaign,
            &config.linker,
            write_mode(double_write),
        )?),
        Command::Place {
            campaign,
            roads,
            output,
        } => {
            let roads: FeatureCollection = serde_json::from_str(&read_to_string(&roads)?)
                .with_context(|| format!("failed to parse {}", roads.display()))?;
            let roads: Vec<_> = roads
                .features
                .iter()
                .filter_map(|x| x.geometry.as_ref())
                .flat_map(|x| x.lines())
                .collect();
            let buildings = store.campaign_buildings(campaign)?;
            info!(buildings = buildings.len(), roads = roads.len(), "placing");

            let placements = place_all(store, &buildings, &roads, &config.placement);
            match output {
                Some(path) => {
                    let mut contents = serde_json::to_string_pretty(&placements)?;
                    contents.push('\n');
                    write(path, contents)?;
                    Ok(())
                }
                None => print(&placements),
            }
        }
        Command::Sequence {
            campaign,
            name,
            workspace,
            assignee,
            save,
        } => {
            let mut addresses = store.campaign_addresses(campaign)?;
            let total = addresses.len();
            addresses.retain(|x| x.building_id.is_some());
            if addresses.len() < total {
                warn!(
                    skipped = total - addresses.len(),
                    "leaving out addresses without a building"
                );
            }

            let sequence = sequence(&addresses);
            let request = PlanRequest {
                campaign_id: campaign,
                workspace_id: workspace,
                name: name.unwrap_or_else(|| {
                    format!("Route {}", chrono::Local::now().format("%Y-%m-%d"))
                }),
                assignee,
            };
            let (plan, stamped) =
                build_plan(&addresses, &sequence, request, config.routing.walking_speed_kmh);
            if save {
                store.save_plan(&plan)?;
                store.upsert_addresses(&stamped)?;
                info!(plan = %plan.id, stops = plan.stops.len(), "saved plan");
            }
            print(&plan)
        }
        Command::BridgeImport {
            release,
            input,
            batch,
        } => print(&import_bridge(
            store,
            &BridgeImport {
                release_date: release,
                input,
                batch,
            },
        )?),
        Command::BridgeRepair {
            campaign,
            double_write,
        } => print(&repair_bridged(
            store,
            &BridgeRepair {
                campaign,
                mode: write_mode(double_write),
                batch: config.linker.write_batch,
            },
        )?),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doorstep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    match &config.store {
        StoreConfig::Local { dir } => run(
            &LocalStore::new(dir, config.linker.direct_match_radius_m),
            &config,
            cli.command,
        ),
        StoreConfig::Rest(rest) => run(&RestClient::new(rest)?, &config, cli.command),
    }
}
