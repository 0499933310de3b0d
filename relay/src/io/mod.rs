//! Filesystem and process side of the relay: state files, config, agents.

pub mod archive;
pub mod config;
pub mod launcher;
pub mod lock;
pub mod paths;
pub mod pipeline_state;
pub mod process;
pub mod prompt;
pub mod shutdown;
pub mod state_store;
pub mod status;
pub mod verify;
