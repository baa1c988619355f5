use std::sync::Arc;
use std::time::Duration;

use libconfd::Config;
use libconfd::Error;
use libconfd::Processor;

use crate::commons::wait_until;
use crate::commons::Sandbox;
use crate::commons::SharedBackend;
use crate::enable_logger;

fn continuous(
    sandbox: &Sandbox,
    watch: bool,
) -> Config {
    Config {
        onetime: false,
        watch,
        interval: 1,
        ..sandbox.config()
    }
}

#[tokio::test]
async fn test_watch_follows_backend_changes() {
    enable_logger();
    let sandbox = Sandbox::new();
    sandbox.add_resource("a.conf", "/svc", &["a"], "a={{ getv(\"/a\") }}\n", "");
    sandbox.add_resource("b.conf", "/svc", &["b"], "b={{ getv(\"/b\", \"unset\") }}\n", "");
    let backend = Arc::new(SharedBackend::new(true));
    backend.set("/svc/a", "1");

    let processor = Processor::new();
    let handle = processor.go(continuous(&sandbox, true), backend.clone()).await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || sandbox.read("a.conf") == "a=1\n").await);
    assert!(wait_until(Duration::from_secs(3), || sandbox.read("b.conf") == "b=unset\n").await);

    // let both watchers settle on the current version
    tokio::time::sleep(Duration::from_millis(200)).await;
    backend.set("/svc/a", "2");
    backend.set("/svc/b", "x");
    assert!(wait_until(Duration::from_secs(3), || sandbox.read("a.conf") == "a=2\n").await);
    assert!(wait_until(Duration::from_secs(3), || sandbox.read("b.conf") == "b=x\n").await);

    processor.close().await;
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn test_watch_without_backend_support_polls() {
    let sandbox = Sandbox::new();
    sandbox.add_resource("a.conf", "/svc", &["a"], "a={{ getv(\"/a\") }}\n", "");
    let backend = Arc::new(SharedBackend::new(false));
    backend.set("/svc/a", "1");

    let processor = Processor::new();
    let handle = processor.go(continuous(&sandbox, true), backend.clone()).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || sandbox.read("a.conf") == "a=1\n").await);

    backend.set("/svc/a", "3");
    assert!(wait_until(Duration::from_secs(4), || sandbox.read("a.conf") == "a=3\n").await);

    processor.close().await;
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn test_interval_survives_failing_resource() {
    let sandbox = Sandbox::new();
    sandbox.add_resource("good.conf", "/svc", &["a"], "a={{ getv(\"/a\") }}\n", "");
    sandbox.add_resource("bad.conf", "/svc", &["missing"], "{{ getv(\"/missing\") }}", "");
    let backend = Arc::new(SharedBackend::new(true));
    backend.set("/svc/a", "1");

    let processor = Processor::new();
    let handle = processor.go(continuous(&sandbox, false), backend.clone()).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || sandbox.read("good.conf") == "a=1\n").await);

    // the bad resource recovers once its key shows up
    backend.set("/svc/missing", "found");
    assert!(wait_until(Duration::from_secs(4), || sandbox.read("bad.conf") == "found").await);

    processor.close().await;
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn test_calls_after_close_are_refused() {
    let sandbox = Sandbox::new();
    let processor = Processor::new();
    processor.close().await;

    let result = processor
        .run(sandbox.config(), Arc::new(SharedBackend::new(true)))
        .await;
    assert!(matches!(result, Err(Error::ProcessorShutdown)));
}
