//! Generated etcd v3 client/server stubs (subset).

#[allow(clippy::all)]
pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}
