use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;
use tracing::debug;

use crate::proto::etcdserverpb::auth_server::Auth;
use crate::proto::etcdserverpb::auth_server::AuthServer;
use crate::proto::etcdserverpb::kv_server::Kv;
use crate::proto::etcdserverpb::kv_server::KvServer;
use crate::proto::etcdserverpb::watch_request::RequestUnion;
use crate::proto::etcdserverpb::watch_server::Watch;
use crate::proto::etcdserverpb::watch_server::WatchServer;
use crate::proto::etcdserverpb::AuthenticateRequest;
use crate::proto::etcdserverpb::AuthenticateResponse;
use crate::proto::etcdserverpb::Event;
use crate::proto::etcdserverpb::KeyValue;
use crate::proto::etcdserverpb::RangeRequest;
use crate::proto::etcdserverpb::RangeResponse;
use crate::proto::etcdserverpb::ResponseHeader;
use crate::proto::etcdserverpb::WatchCreateRequest;
use crate::proto::etcdserverpb::WatchRequest;
use crate::proto::etcdserverpb::WatchResponse;

/// Scriptable etcd v3 server covering Range, Watch and Authenticate.
#[derive(Clone, Default)]
pub struct MockEtcd {
    pub kvs: Arc<Mutex<BTreeMap<String, String>>>,
    pub revision: i64,
    /// Credentials accepted by Authenticate; when set, requests need the token
    pub credentials: Option<(String, String)>,
    /// Status returned by every Range call instead of data
    pub range_status: Option<Status>,
    /// Events streamed to every watcher after the created response
    pub watch_events: Vec<(String, String, i64)>,
    /// When set, every watch is refused with (compact_revision, reason)
    pub watch_cancel: Option<(i64, String)>,
    pub range_requests: Arc<Mutex<Vec<RangeRequest>>>,
    pub watch_requests: Arc<Mutex<Vec<WatchCreateRequest>>>,
}

pub const MOCK_ETCD_TOKEN: &str = "mock-token";

impl MockEtcd {
    pub fn with_values(values: &[(&str, &str)]) -> Self {
        let mock = Self {
            revision: 10,
            ..Default::default()
        };
        {
            let mut kvs = mock.kvs.lock();
            for (k, v) in values {
                kvs.insert(k.to_string(), v.to_string());
            }
        }
        mock
    }

    fn header(&self) -> Option<ResponseHeader> {
        Some(ResponseHeader {
            revision: self.revision,
            ..Default::default()
        })
    }

    fn check_token<T>(
        &self,
        request: &Request<T>,
    ) -> Result<(), Status> {
        if self.credentials.is_none() {
            return Ok(());
        }
        match request.metadata().get("token").and_then(|t| t.to_str().ok()) {
            Some(MOCK_ETCD_TOKEN) => Ok(()),
            _ => Err(Status::unauthenticated("invalid auth token")),
        }
    }

    /// Serves the mock on an ephemeral port until `shutdown` fires.
    pub async fn serve(
        self,
        shutdown: oneshot::Receiver<()>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        debug!("starting mock etcd on {}", addr);

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(KvServer::new(self.clone()))
                .add_service(WatchServer::new(self.clone()))
                .add_service(AuthServer::new(self))
                .serve_with_incoming_shutdown(tokio_stream::wrappers::TcpListenerStream::new(listener), async {
                    shutdown.await.ok();
                })
                .await
                .unwrap();
        });
        addr
    }
}

#[tonic::async_trait]
impl Kv for MockEtcd {
    async fn range(
        &self,
        request: Request<RangeRequest>,
    ) -> Result<Response<RangeResponse>, Status> {
        self.check_token(&request)?;
        let req = request.into_inner();
        self.range_requests.lock().push(req.clone());
        if let Some(status) = &self.range_status {
            return Err(status.clone());
        }

        let start = req.key.clone();
        let end = req.range_end.clone();
        let kvs: Vec<KeyValue> = self
            .kvs
            .lock()
            .iter()
            .filter(|(k, _)| {
                let k = k.as_bytes();
                if end.is_empty() {
                    k == start.as_slice()
                } else {
                    k >= start.as_slice() && (end == [0] || k < end.as_slice())
                }
            })
            .map(|(k, v)| KeyValue {
                key: k.as_bytes().to_vec(),
                value: v.as_bytes().to_vec(),
                mod_revision: self.revision,
                ..Default::default()
            })
            .collect();
        Ok(Response::new(RangeResponse {
            header: self.header(),
            count: kvs.len() as i64,
            kvs,
            more: false,
        }))
    }
}

type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchResponse, Status>> + Send>>;

#[tonic::async_trait]
impl Watch for MockEtcd {
    type WatchStream = WatchStream;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        self.check_token(&request)?;
        let mut inbound = request.into_inner();
        let create = match inbound.message().await? {
            Some(WatchRequest {
                request_union: Some(RequestUnion::CreateRequest(create)),
            }) => create,
            _ => return Err(Status::invalid_argument("expected a create request")),
        };
        self.watch_requests.lock().push(create);

        let (tx, rx) = mpsc::channel(8);
        let header = self.header();
        let events = self.watch_events.clone();
        let cancel = self.watch_cancel.clone();
        tokio::spawn(async move {
            let mut created = WatchResponse {
                header: header.clone(),
                created: true,
                ..Default::default()
            };
            if let Some((compact_revision, reason)) = cancel {
                created.canceled = true;
                created.compact_revision = compact_revision;
                created.cancel_reason = reason;
                let _ = tx.send(Ok(created)).await;
                tx.closed().await;
                return;
            }
            if tx.send(Ok(created)).await.is_err() {
                return;
            }
            for (key, value, revision) in events {
                let resp = WatchResponse {
                    header: Some(ResponseHeader {
                        revision,
                        ..Default::default()
                    }),
                    events: vec![Event {
                        kv: Some(KeyValue {
                            key: key.into_bytes(),
                            value: value.into_bytes(),
                            mod_revision: revision,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                };
                if tx.send(Ok(resp)).await.is_err() {
                    return;
                }
            }
            // hold the stream open like a real server
            tx.closed().await;
            drop(inbound);
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as WatchStream))
    }
}

#[tonic::async_trait]
impl Auth for MockEtcd {
    async fn authenticate(
        &self,
        request: Request<AuthenticateRequest>,
    ) -> Result<Response<AuthenticateResponse>, Status> {
        let req = request.into_inner();
        match &self.credentials {
            Some((user, password)) if *user == req.name && *password == req.password => {
                Ok(Response::new(AuthenticateResponse {
                    header: self.header(),
                    token: MOCK_ETCD_TOKEN.to_string(),
                }))
            }
            _ => Err(Status::invalid_argument("authentication failed")),
        }
    }
}
