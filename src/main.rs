use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use serde_json::json;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use street_coverage_rs::breadcrumbs::{BreadcrumbStore, FileBreadcrumbStore, MemoryBreadcrumbStore};
use street_coverage_rs::directions::OsrmClient;
use street_coverage_rs::drive::{replay_session, DriveSummary, DriveTracker};
use street_coverage_rs::network::{parse_osm_json, BoundingBox, OverpassFetcher};
use street_coverage_rs::{CoverageTracker, Position, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "street_coverage")]
#[command(about = "Track which streets of an area have been driven", long_about = None)]
struct Args {
    /// JSON config file (defaults apply to missing fields)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the visit threshold in meters
    #[arg(long, global = true)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recorded track or stored session against a street network offline
    Replay {
        /// Overpass JSON street network
        #[arg(long)]
        network: PathBuf,

        /// JSON array of positions (.json or .json.gz)
        #[arg(long, conflicts_with = "session")]
        track: Option<PathBuf>,

        /// Session id in the configured breadcrumb directory
        #[arg(long)]
        session: Option<u64>,
    },

    /// Download the raw street network around a point
    Fetch {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lng: f64,

        /// Half-width of the box in degrees (config `area_offset_deg` if omitted)
        #[arg(long)]
        offset: Option<f64>,

        #[arg(long)]
        out: PathBuf,
    },

    /// Print turn-by-turn directions between two points
    Directions {
        #[arg(long, allow_hyphen_values = true)]
        from_lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        from_lng: f64,

        #[arg(long, allow_hyphen_values = true)]
        to_lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        to_lng: f64,
    },
}

fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => TrackerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.visit_threshold_m = threshold;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_track(path: &Path) -> Result<Vec<Position>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let positions = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
    } else {
        serde_json::from_reader(BufReader::new(file))
    };
    positions.with_context(|| format!("Failed to parse track {}", path.display()))
}

fn load_network(path: &Path, config: &TrackerConfig) -> Result<Arc<CoverageTracker>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read network {}", path.display()))?;
    let segments = parse_osm_json(&text).context("Failed to parse street network")?;

    let tracker = Arc::new(CoverageTracker::new(config.clone()));
    tracker.load_area(segments)?;
    Ok(tracker)
}

fn drive_track<S: BreadcrumbStore>(
    tracker: Arc<CoverageTracker>,
    store: S,
    positions: &[Position],
) -> Result<DriveSummary> {
    let drive = DriveTracker::new(tracker, store);
    drive.start(Some("Replay"))?;

    let mut rejected = 0usize;
    for position in positions {
        if let Err(e) = drive.on_position(position) {
            log::warn!("Skipping position: {}", e);
            rejected += 1;
        }
    }
    if rejected > 0 {
        log::warn!("{} of {} positions rejected", rejected, positions.len());
    }

    Ok(drive.stop()?)
}

fn run_replay(
    config: &TrackerConfig,
    network: &Path,
    track: Option<&Path>,
    session: Option<u64>,
) -> Result<()> {
    let tracker = load_network(network, config)?;

    let summary = match (track, session) {
        (Some(track), _) => {
            let positions = load_track(track)?;
            match config.breadcrumb_dir.as_ref() {
                Some(dir) => {
                    drive_track(tracker.clone(), FileBreadcrumbStore::open(dir)?, &positions)?
                }
                None => drive_track(tracker.clone(), MemoryBreadcrumbStore::new(), &positions)?,
            }
        }
        (None, Some(session_id)) => {
            let Some(dir) = config.breadcrumb_dir.as_ref() else {
                bail!("--session requires breadcrumb_dir in the config file");
            };
            let store = FileBreadcrumbStore::open(dir)?;
            replay_session(&store, &tracker, session_id)?
        }
        (None, None) => bail!("Provide --track or --session"),
    };

    let state = tracker.state()?;
    let unvisited: Vec<&str> = state
        .segments()
        .iter()
        .filter(|s| !s.visited)
        .map(|s| s.id.as_str())
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "network": network.display().to_string(),
            "session": summary.session,
            "distance_km": summary.trip.distance_km(),
            "samples": summary.trip.sample_count,
            "progress": summary.progress,
            "unvisited": unvisited,
        }))?
    );
    Ok(())
}

async fn run_fetch(
    config: &TrackerConfig,
    lat: f64,
    lng: f64,
    offset: Option<f64>,
    out: &Path,
) -> Result<()> {
    let bbox = BoundingBox::around(lat, lng, offset.unwrap_or(config.area_offset_deg));
    bbox.validate()?;

    let mut fetcher = OverpassFetcher::new(config);
    let body = fetcher
        .fetch_bbox(&bbox)
        .await
        .context("Failed to fetch street network")?;
    let segments = parse_osm_json(&body).context("Provider returned an unreadable network")?;

    fs::write(out, &body).with_context(|| format!("Failed to write {}", out.display()))?;
    log::info!(
        "Saved {} driveable streets to {}",
        segments.len(),
        out.display()
    );
    Ok(())
}

async fn run_directions(config: &TrackerConfig, from: (f64, f64), to: (f64, f64)) -> Result<()> {
    for (lat, lng) in [from, to] {
        Position::new(lat, lng).validate()?;
    }

    let client = OsrmClient::new(config);
    let route = client
        .fetch_route(from, to)
        .await
        .context("Failed to get directions")?;

    println!("{}", serde_json::to_string_pretty(&route)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match &args.command {
        Command::Replay {
            network,
            track,
            session,
        } => run_replay(&config, network, track.as_deref(), *session),
        Command::Fetch {
            lat,
            lng,
            offset,
            out,
        } => run_fetch(&config, *lat, *lng, *offset, out).await,
        Command::Directions {
            from_lat,
            from_lng,
            to_lat,
            to_lng,
        } => run_directions(&config, (*from_lat, *from_lng), (*to_lat, *to_lng)).await,
    }
}
