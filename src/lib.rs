pub mod config;
pub mod engine;
pub mod model;
pub mod relay;
pub mod rtmp;
pub mod session;
pub mod signaling;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
