pub mod balancer;
pub mod chord;
pub mod error;
pub mod logging;
pub mod network;
pub mod verify;
