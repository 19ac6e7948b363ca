//! Shared fixtures for unit tests.

mod fixtures;
mod sim_device;
mod temp;

pub use fixtures::DfuFileBuilder;
pub use sim_device::{SimulatedBootloader, Transfer};
pub use temp::TestContext;
