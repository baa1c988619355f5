//! etcd v3 cluster-store backend over gRPC.

mod client;
mod pool;

pub use client::*;
pub(crate) use pool::normalize_endpoint;
pub(crate) use pool::prefix_range_end;
