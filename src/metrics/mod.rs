use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::error;
use warp::Filter;
use warp::Rejection;
use warp::Reply;


lazy_static! {
    /// Completed resource passes, labelled by outcome (`ok` / `error`)
    pub static ref RESOURCE_PASSES: IntCounterVec = IntCounterVec::new(
        Opts::new("resource_passes", "Completed resource sync passes"),
        &["dest", "outcome"]
    )
    .expect("metric can not be created");

    /// Destination files replaced
    pub static ref FILE_WRITES: IntCounterVec = IntCounterVec::new(
        Opts::new("file_writes", "Destination files replaced"),
        &["dest"]
    )
    .expect("metric can not be created");

    /// Failed check/reload commands
    pub static ref COMMAND_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("command_failures", "Check or reload commands exiting non-zero"),
        &["dest", "kind"]
    )
    .expect("metric can not be created");

    pub static ref PASS_LATENCY_METRIC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("pass_latency_ms", "Histogram of resource pass latency in ms")
            .buckets(exponential_buckets(1.0, 2.0, 16).expect("valid buckets")),
        &["dest"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub(crate) fn register_custom_metrics(registry: &Registry) {
    for collector in [
        Box::new(RESOURCE_PASSES.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(FILE_WRITES.clone()),
        Box::new(COMMAND_FAILURES.clone()),
        Box::new(PASS_LATENCY_METRIC.clone()),
    ] {
        // Registering twice (tests, restarts) is harmless.
        if let Err(e) = registry.register(collector) {
            tracing::debug!("collector not registered: {}", e);
        }
    }
}

/// Serves `/metrics` on `port` until `shutdown` fires.
pub async fn start_server(
    port: u16,
    shutdown: CancellationToken,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (_, server) = warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
        shutdown.cancelled().await;
    });
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(encode_metrics(&REGISTRY))
}

pub(crate) fn encode_metrics(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
