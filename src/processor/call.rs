use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::BackendClient;
use crate::Config;
use crate::Error;
use crate::Result;

/// One submitted unit of work: a frozen configuration and the client it
/// runs against.
///
/// A call is completed exactly once. Later completions are dropped.
pub struct Call {
    id: String,
    pub(crate) config: Arc<Config>,
    pub(crate) client: Arc<dyn BackendClient>,
    err: Arc<Mutex<Option<Error>>>,
    done_tx: mpsc::Sender<()>,
    fired: AtomicBool,
}

/// Caller side of a [`Call`], resolves once the call completed.
pub struct CallHandle {
    id: String,
    err: Arc<Mutex<Option<Error>>>,
    done_rx: mpsc::Receiver<()>,
}

impl Call {
    pub(crate) fn new(
        config: Config,
        client: Arc<dyn BackendClient>,
    ) -> (Self, CallHandle) {
        let id = nanoid::nanoid!(10);
        let err = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = mpsc::channel(1);
        let call = Self {
            id: id.clone(),
            config: Arc::new(config),
            client,
            err: err.clone(),
            done_tx,
            fired: AtomicBool::new(false),
        };
        (call, CallHandle { id, err, done_rx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Records `result` and signals completion.
    ///
    /// Returns `false` when the call had already completed.
    pub(crate) fn done(
        &self,
        result: Result<()>,
    ) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            warn!(call = %self.id, "duplicate completion dropped: {:?}", result.err());
            return false;
        }
        if let Err(e) = result {
            *self.err.lock() = Some(e);
        }
        if let Err(e) = self.done_tx.try_send(()) {
            debug!(call = %self.id, "completion not delivered: {}", e);
        }
        true
    }
}

impl CallHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the call to complete and returns its outcome.
    pub async fn wait(mut self) -> Result<()> {
        if self.done_rx.recv().await.is_none() {
            // Sender dropped without signalling: the worker died
            if let Some(e) = self.err.lock().take() {
                return Err(e);
            }
            return Err(Error::Fatal(format!("call {} dropped before completion", self.id)));
        }
        match self.err.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Non-blocking variant of [`wait`](Self::wait); `None` while running.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.done_rx.try_recv() {
            Ok(()) => Some(match self.err.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Some(Err(Error::Fatal(format!("call {} dropped before completion", self.id))))
            }
        }
    }
}
