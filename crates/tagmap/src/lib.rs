//! High-level facade crate for the `tagmap-*` workspace.
//!
//! This crate provides:
//! - re-exports of the pose/camera core and of the map builder
//! - data-directory I/O ([`io`]): `config.json` plus `tags_*.txt` in,
//!   `map.json` and `viewpoints.json` out
//! - (feature `cli`) the `tagmap` binary
//!
//! ## Quickstart
//!
//! ```no_run
//! use tagmap::builder::{build_map, MapBuilder};
//! use tagmap::core::Se2;
//! use tagmap::io::{load_data_dir, write_map, write_viewpoints, BuildConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = load_data_dir("captures")?;
//! let config = BuildConfig::default();
//! let mut builder: MapBuilder<Se2> =
//!     MapBuilder::new(data.cameras, data.tag_sizes, config.builder);
//! let report = build_map(&mut builder, &data.viewpoints, &config.convergence)?;
//! write_map("out", &report.map)?;
//! write_viewpoints("out", &report.viewpoints)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `tagmap::core`: pose variants, camera model, homography and PnP.
//! - `tagmap::builder`: observation graph, initializer, refinement engine,
//!   driver loop and localization.
//! - `tagmap::io`: on-disk formats.

pub use tagmap_builder as builder;
pub use tagmap_core as core;

pub use tagmap_builder::{MapBuilder, MapError, TagMap};
pub use tagmap_core::{MapKind, Se2, Se2Height, Se3};

pub mod io;
