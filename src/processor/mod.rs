//! Processing engine.
//!
//! [`Processor`] accepts calls, each pairing a [`Config`](crate::Config) with a
//! [`BackendClient`](crate::BackendClient), and runs them in one of three
//! modes:
//! - once: every resource is processed a single time;
//! - interval: all resources are processed, then the worker sleeps;
//! - watch: one watcher per resource re-processes it on backend changes.
//!
//! ```ignore
//! let processor = Processor::new();
//! let handle = processor.go(config, client).await?;
//! handle.wait().await?;
//! processor.close().await;
//! ```

mod call;
mod engine;
mod resource_processor;

pub use call::*;
pub use engine::*;
pub use resource_processor::*;
