//! # Voxel Server Entry Point
//!
//! Thin wrapper around the library's `run()`: a headless world simulation
//! that generates terrain around a wandering player, runs the growth and
//! liquid rules, and persists the result.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -- [world_dir] [settings.json]
//! ```

fn main() {
    if let Err(e) = voxel_server::run() {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
