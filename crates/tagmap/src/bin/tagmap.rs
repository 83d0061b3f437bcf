use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::LevelFilter;
use tagmap::builder::{
    build_map, localize_viewpoint, Localization, MapBuilder, TagMap, ViewpointId,
};
use tagmap::core::{MapKind, PnpParams, Se2, Se2Height, Se3, TagPose};
use tagmap::io::{
    load_data_dir, load_map, read_map_kind, write_json, write_map, write_viewpoints, BuildConfig,
    DataSet, MAP_FILE,
};

/// Build and use fiducial tag maps.
#[derive(Debug, Parser)]
#[command(author, version, about = "Fiducial tag map builder")]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    /// Emit JSON log lines instead of text.
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build `map.json` and `viewpoints.json` from a data directory.
    Build {
        /// Directory with `config.json` and `tags_*.txt` files.
        #[arg(long)]
        input_data_dir: PathBuf,
        /// Directory receiving the map; created if missing.
        #[arg(long)]
        output_data_dir: PathBuf,
        /// Map variant: 2d, 2.5d or 3d.
        #[arg(long, default_value = "2d")]
        mode: MapKind,
        /// Optional JSON with `builder` / `convergence` overrides.
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Locate the viewpoints of a data directory in an existing map.
    Localize {
        /// Directory containing `map.json`.
        #[arg(long)]
        map_dir: PathBuf,
        /// Directory with `config.json` and `tags_*.txt` files.
        #[arg(long)]
        input_data_dir: PathBuf,
        /// Output JSON file; printed to stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Optional JSON with `builder.pnp` overrides.
        #[arg(long)]
        params: Option<PathBuf>,
    },
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Command::Build {
            input_data_dir,
            output_data_dir,
            mode,
            params,
        } => {
            let config = load_config(params.as_deref())?;
            let data = load_data_dir(&input_data_dir)?;
            match mode {
                MapKind::Planar => run_build::<Se2>(data, config, &output_data_dir),
                MapKind::PlanarHeight => run_build::<Se2Height>(data, config, &output_data_dir),
                MapKind::Spatial => run_build::<Se3>(data, config, &output_data_dir),
            }
        }
        Command::Localize {
            map_dir,
            input_data_dir,
            output,
            params,
        } => {
            let pnp = load_config(params.as_deref())?.builder.pnp;
            let map_path = map_dir.join(MAP_FILE);
            let data = load_data_dir(&input_data_dir)?;
            let located = match read_map_kind(&map_path)? {
                MapKind::Planar => run_localize::<Se2>(&map_path, &data, &pnp)?,
                MapKind::PlanarHeight => run_localize::<Se2Height>(&map_path, &data, &pnp)?,
                MapKind::Spatial => run_localize::<Se3>(&map_path, &data, &pnp)?,
            };
            match output {
                Some(path) => {
                    write_json(&path, &located)?;
                    log::info!("wrote {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&located)?),
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "tracing"))]
fn init_logging(cli: &Cli) -> Result<(), Box<dyn Error>> {
    tagmap::core::init_with_level(cli.log_level)?;
    Ok(())
}

#[cfg(feature = "tracing")]
fn init_logging(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let _ = tracing_log::LogTracer::init();
    let directive = cli.log_level.to_string().to_lowercase();
    tagmap::core::init_tracing(&directive, cli.log_json);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BuildConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => BuildConfig::load_json(path)?,
        None => BuildConfig::default(),
    })
}

fn run_build<P: TagPose>(
    data: DataSet,
    config: BuildConfig,
    out: &Path,
) -> Result<(), Box<dyn Error>> {
    let mut builder: MapBuilder<P> =
        MapBuilder::new(data.cameras, data.tag_sizes, config.builder);
    let report = build_map(&mut builder, &data.viewpoints, &config.convergence)?;
    for (node, err) in &report.deferred {
        log::warn!("{node} left out of the map: {err}");
    }

    let map_path = write_map(out, &report.map)?;
    let viewpoints_path = write_viewpoints(out, &report.viewpoints)?;
    log::info!(
        "{} map with {} tags and {} viewpoints after {} iterations, error {:.6e}",
        P::KIND,
        report.map.len(),
        report.viewpoints.len(),
        report.iterations,
        report.final_error
    );
    println!("{}", map_path.display());
    println!("{}", viewpoints_path.display());
    Ok(())
}

fn run_localize<P: TagPose>(
    map_path: &Path,
    data: &DataSet,
    pnp: &PnpParams,
) -> Result<BTreeMap<ViewpointId, Localization>, Box<dyn Error>> {
    let map: TagMap<P> = load_map(map_path)?;
    let mut located = BTreeMap::new();
    for viewpoint in &data.viewpoints {
        let Some(camera) = data.cameras.get(&viewpoint.camera) else {
            log::warn!(
                "viewpoint `{}` uses unknown camera {}",
                viewpoint.id,
                viewpoint.camera
            );
            continue;
        };
        match localize_viewpoint(&map, viewpoint, camera, pnp) {
            Ok(loc) => {
                log::info!(
                    "viewpoint `{}`: {} tags, rms {:.3} px",
                    viewpoint.id,
                    loc.tags_used.len(),
                    loc.rms_px
                );
                located.insert(viewpoint.id.clone(), loc);
            }
            Err(err) => log::warn!("viewpoint `{}` not localized: {err}", viewpoint.id),
        }
    }
    Ok(located)
}
