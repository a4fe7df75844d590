//! Depot daemon: wires the metadata store, storage facade and transfer
//! engine together and runs the background expiry sweep.

pub mod config;
pub mod state;
pub mod sweeper;

pub use config::load_config;
pub use state::AppState;
pub use sweeper::{spawn_sweeper, sweep_once};
