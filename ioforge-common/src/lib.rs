pub mod config;
pub mod events;
pub mod model;
pub mod tracing;
pub mod util;

#[cfg(test)]
test_r::enable!();
