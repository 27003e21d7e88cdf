#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

//! # Voxel Server
//!
//! The server-side world simulation core of a voxel sandbox game: sparse
//! block storage with background persistence, asynchronous world generation,
//! lighting propagation, liquid settling, probabilistic growth rules, and an
//! active object registry.
//!
//! ## Key Modules
//!
//! * `core` - Concurrency and container primitives shared by everything else
//! * `world_state` - The authoritative map: blocks, contents, lighting,
//!   liquids, persistence
//! * `simulation_state` - The tick layer: objects, rules, emerge, the
//!   environment
//! * `settings` - Startup configuration
//!
//! ## Architecture
//!
//! One simulation thread owns all authoritative mutation through a
//! [`simulation_state::environment::ServerEnvironment`]; emerge worker
//! threads generate or load blocks and hand them back over a completion
//! queue. Blocks are shared as reference-counted handles with per-block
//! locks, so readers on other threads never block the tick for long.
//!
//! ## Usage
//!
//! ```no_run
//! fn main() -> anyhow::Result<()> {
//!     voxel_server::run()
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cgmath::Point3;
use log::info;

use crate::settings::Settings;
use crate::simulation_state::abm::grow_tree::add_grow_rules;
use crate::simulation_state::environment::ServerEnvironment;
use crate::simulation_state::objects::player::PlayerObject;
use crate::world_state::content::ContentRegistry;
use crate::world_state::persistence::{FileDatabase, MapDatabase};

pub mod core;
pub mod settings;
pub mod simulation_state;
pub mod world_state;

/// Fixed timestep of the demo loop, seconds.
const DEMO_DTIME: f32 = 0.1;
/// Default number of steps the demo server runs before saving and exiting.
const DEMO_STEPS: u32 = 3000;
/// Steps between stats lines.
const STATS_EVERY: u32 = 100;

/// Runs the headless demo server.
///
/// Arguments: an optional world directory (default `world`), an optional
/// settings JSON path, and an optional step count. The world is simulated
/// for that many fixed-dtime steps with a wandering player keeping an
/// active window alive, then saved and shut down.
pub fn run() -> Result<()> {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    let mut args = std::env::args().skip(1);
    let world_dir = args.next().map_or_else(|| PathBuf::from("world"), PathBuf::from);
    let settings = match args.next() {
        Some(path) => Settings::load(Path::new(&path))?,
        None => Settings::default(),
    };
    let steps = match args.next() {
        Some(n) => n.parse::<u32>().context("parsing step count")?,
        None => DEMO_STEPS,
    };

    info!("world directory: {}", world_dir.display());
    let registry = Arc::new(ContentRegistry::with_builtin());
    let database: Arc<dyn MapDatabase> = Arc::new(FileDatabase::new(&world_dir)?);
    let mut env = ServerEnvironment::new(registry, Some(database), settings);
    add_grow_rules(&mut env);
    env.add_object(Box::new(PlayerObject::new(Point3::new(0.0, 8.0, 0.0))))
        .context("registering the demo player")?;

    for step in 1..=steps {
        env.step(DEMO_DTIME);
        if step % STATS_EVERY == 0 {
            let stats = env.stats();
            info!(
                "t={:.1}s blocks={} active={} objects={} liquid_queue={} emerging={}",
                env.game_time(),
                stats.blocks_loaded,
                stats.active_blocks,
                stats.objects,
                stats.liquid_queue,
                stats.pending_emerge,
            );
        }
    }

    env.save_and_shutdown();
    info!("simulated {:.1}s of game time", env.game_time());
    Ok(())
}
