pub mod actor;
pub mod command;
pub mod hash;
pub mod routing;
pub mod simulation;
pub mod types;
pub mod virtual_nodes;
pub mod workers;

use std::time::Duration;

// Ring configuration
pub const NUM_BITS: usize = 8;
pub const RING_SIZE: u32 = 1 << NUM_BITS;

pub const STABILIZE_INTERVAL: Duration = Duration::from_secs(15);
pub const FIX_FINGERS_INTERVAL: Duration = Duration::from_secs(10);

// Wait budget for a single driver-issued command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
