//! Reactive configuration synchronization.
//!
//! Renders local configuration files from templates fed by a remote
//! key/value backend and keeps them converged, once, on an interval, or on
//! backend change notifications.

mod backends;
mod config;
pub mod constants;
mod errors;
pub mod metrics;
mod processor;
pub mod proto;
mod resource;
mod template;
pub mod utils;

pub use backends::*;
pub use config::*;
pub use errors::*;
pub use processor::*;
pub use resource::*;
pub use template::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
