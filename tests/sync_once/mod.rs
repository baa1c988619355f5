use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use libconfd::BackendClient;
use libconfd::BackendConfig;
use libconfd::BackendRegistry;
use libconfd::Config;
use libconfd::Error;
use libconfd::Hooks;
use libconfd::Processor;
use libconfd::SyncError;
use serde_json::json;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::commons::Sandbox;
use crate::commons::SharedBackend;
use crate::enable_logger;

#[tokio::test]
async fn test_once_renders_checks_and_reloads() {
    enable_logger();
    let sandbox = Sandbox::new();
    sandbox.add_resource(
        "nginx.conf",
        "/nginx",
        &["worker_count", "upstreams"],
        "worker_processes {{ getv(\"/worker_count\") }};\n\
         {% for u in getvs(\"/upstreams/*\") %}server {{ u }};\n{% endfor %}",
        "check_cmd = \"grep -q worker_processes {{ src }}\"\n\
         reload_cmd = \"touch ${RUNTIME_CONFDIR}/reloaded\"",
    );
    let backend = Arc::new(SharedBackend::new(true));
    backend.set("/nginx/worker_count", "4");
    backend.set("/nginx/upstreams/a", "10.0.0.1:80");
    backend.set("/nginx/upstreams/b", "10.0.0.2:80");

    let processor = Processor::new();
    processor.run(sandbox.config(), backend).await.unwrap();
    processor.close().await;

    assert_eq!(
        sandbox.read("nginx.conf"),
        "worker_processes 4;\nserver 10.0.0.1:80;\nserver 10.0.0.2:80;\n"
    );
    assert!(sandbox.root().join("reloaded").exists());
}

#[tokio::test]
async fn test_once_is_idempotent() {
    let sandbox = Sandbox::new();
    sandbox.add_resource("app.conf", "/app", &["port"], "port={{ getv(\"/port\") }}\n", "");
    let backend = Arc::new(SharedBackend::new(true));
    backend.set("/app/port", "8080");

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let config = sandbox.config().with_hooks(Hooks {
        on_update_done: Some(Arc::new(move |_dest: &std::path::Path, _cmd: &str, _err: Option<&Error>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    });

    let processor = Processor::new();
    processor.run(config.clone(), backend.clone()).await.unwrap();
    processor.run(config.clone(), backend.clone()).await.unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    backend.set("/app/port", "9090");
    processor.run(config, backend).await.unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 2);
    assert_eq!(sandbox.read("app.conf"), "port=9090\n");
    processor.close().await;
}

#[tokio::test]
async fn test_failed_check_reports_and_keeps_old_file() {
    let sandbox = Sandbox::new();
    sandbox.add_resource("app.conf", "/app", &["port"], "port={{ getv(\"/port\") }}\n", "check_cmd = \"exit 1\"");
    std::fs::write(sandbox.out("app.conf"), "port=1\n").unwrap();
    let backend = Arc::new(SharedBackend::new(true));
    backend.set("/app/port", "8080");

    let processor = Processor::new();
    let result = processor.run(sandbox.config(), backend).await;
    processor.close().await;

    assert!(matches!(result, Err(Error::Sync(SyncError::CheckFailed { .. }))));
    assert_eq!(sandbox.read("app.conf"), "port=1\n");
}

#[tokio::test]
async fn test_noop_reports_without_writing() {
    let sandbox = Sandbox::new();
    sandbox.add_resource("app.conf", "/app", &["port"], "port={{ getv(\"/port\") }}\n", "");
    let backend = Arc::new(SharedBackend::new(true));
    backend.set("/app/port", "8080");

    let processor = Processor::new();
    let config = Config {
        noop: true,
        ..sandbox.config()
    };
    processor.run(config, backend).await.unwrap();
    processor.close().await;

    assert!(!sandbox.out("app.conf").exists());
}

#[tokio::test]
async fn test_custom_backend_through_registry() {
    let sandbox = Sandbox::new();
    sandbox.add_resource("app.conf", "/app", &["port"], "port={{ getv(\"/port\") }}\n", "");

    let mut registry = BackendRegistry::new();
    registry.register(
        "shared",
        Arc::new(|_cfg: BackendConfig| {
            async move {
                let backend = SharedBackend::new(false);
                backend.set("/app/port", "7000");
                Ok(Arc::new(backend) as Arc<dyn BackendClient>)
            }
            .boxed()
        }),
    );
    let client = registry
        .new_backend_client(BackendConfig {
            backend_type: "shared".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let processor = Processor::new();
    processor.run(sandbox.config(), client).await.unwrap();
    processor.close().await;

    assert_eq!(sandbox.read("app.conf"), "port=7000\n");
}

#[tokio::test]
async fn test_metad_backend_end_to_end() {
    enable_logger();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tenant/app/port"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(8443)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tenant/app/hosts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["a.internal", "b.internal"])))
        .mount(&server)
        .await;

    let sandbox = Sandbox::new();
    sandbox.add_resource(
        "proxy.conf",
        "/app",
        &["port", "hosts"],
        "listen {{ getv(\"/port\") }}\n{% for h in getvs(\"/hosts/*\") %}upstream {{ h }}\n{% endfor %}",
        "",
    );

    let backend_config = BackendConfig {
        backend_type: "metad".into(),
        host: vec![server.uri()],
        ..Default::default()
    }
    .with_real_key(Arc::new(|k: &str| format!("/tenant{k}")));
    let client = BackendRegistry::with_defaults()
        .new_backend_client(backend_config)
        .await
        .unwrap();
    assert_eq!(client.backend_type(), "metad");

    let processor = Processor::new();
    processor.run(sandbox.config(), client.clone()).await.unwrap();
    processor.close().await;
    client.close().await;

    assert_eq!(
        sandbox.read("proxy.conf"),
        "listen 8443\nupstream a.internal\nupstream b.internal\n"
    );
}
