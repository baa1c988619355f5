//! the test_utils folder here will share utils or test components between unit
//! tests of different modules
mod common;
mod memory_backend;
mod mock_etcd;

pub use common::*;
pub use memory_backend::*;
pub use mock_etcd::*;
