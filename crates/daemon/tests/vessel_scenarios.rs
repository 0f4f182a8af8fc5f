//! End-to-end tests driving a vessel over the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::bus::{Bus, MemoryBus};
use common::protocol::ErrorCode;
use object_store::RepositoryClient;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vessel_daemon::{SchedulerSummary, Vessel, VesselClient, VesselConfig, VesselError};

const SERVICE: &str = "agent-1";

/// Zip bundle built from `(relative path, source)` pairs.
fn bundle(files: &[(&str, &str)]) -> Bytes {
    let src = tempfile::tempdir().unwrap();
    for (name, body) in files {
        let path = src.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }
    let out = tempfile::tempdir().unwrap();
    let dst = common::bundle::build(src.path(), &out.path().join("bundle")).unwrap();
    Bytes::from(std::fs::read(dst).unwrap())
}

struct Harness {
    bus: Arc<dyn Bus>,
    client: VesselClient,
    cancel: CancellationToken,
    vessel: JoinHandle<Result<SchedulerSummary, VesselError>>,
}

impl Harness {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let bus: Arc<dyn Bus> =
            Arc::new(MemoryBus::new().with_request_timeout(Duration::from_secs(5)));
        let config = VesselConfig {
            service_name: SERVICE.to_string(),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let vessel = Vessel::new(bus.clone(), config).unwrap();
        let vessel = tokio::spawn(vessel.run(cancel.clone()));

        let client = VesselClient::new(bus.clone(), SERVICE)
            .with_poll_interval(Duration::from_millis(20));
        // wait for the vessel's rpc endpoint
        for _ in 0..100 {
            match client.get_worker(0).await {
                Err(e) if e.code() == Some(ErrorCode::WorkerNotFound) => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }

        let repos = RepositoryClient::new(bus.clone());
        repos.create_repository("r1").await.unwrap();
        Self {
            bus,
            client,
            cancel,
            vessel,
        }
    }

    async fn put(&self, path: &str, data: Bytes) {
        RepositoryClient::new(self.bus.clone())
            .put_file("r1", path, data)
            .await
            .unwrap();
    }

    async fn stop(self) -> SchedulerSummary {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.vessel)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path() {
    let harness = Harness::start().await;
    harness
        .put("/scripts/hello.fzz", bundle(&[("main.risor", r#"print("hi");"#)]))
        .await;
    let client = &harness.client;

    let id = client.create_worker().await.unwrap();
    assert_eq!(id, 1);
    let worker = client.wait_worker(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(worker.service_name, SERVICE);
    assert!(!worker.service_id.is_empty());

    let mut stdout = client.subscribe_stdout(id).await.unwrap();
    let code = client.execute(id, "r1", "/scripts/hello.fzz").await.unwrap();
    assert_eq!(code, 0);
    let chunk = tokio::time::timeout(Duration::from_secs(5), stdout.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk.subject, "agent-1.1.STDOUT");
    assert_eq!(chunk.payload, Bytes::from_static(b"hi\n"));

    client.destroy_worker(id).await.unwrap();
    let mut gone = false;
    for _ in 0..200 {
        match client.get_worker(id).await {
            Err(e) if e.code() == Some(ErrorCode::WorkerNotFound) => {
                gone = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert!(gone, "worker still registered after destroy");

    let summary = harness.stop().await;
    assert_eq!(summary, SchedulerSummary { created: 1, stopped: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_worker() {
    let harness = Harness::start().await;
    let err = harness.client.destroy_worker(99).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::WorkerNotFound));
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_script_sees_stdin_repositories_and_scratch() {
    let harness = Harness::start().await;
    harness.put("/data.txt", Bytes::from_static(b"from repo")).await;
    harness
        .put(
            "/scripts/io.fzz",
            bundle(&[
                ("lib/util.risor", "fn shout(s) { s.to_upper() }"),
                (
                    "main.risor",
                    r#"
import "lib/util" as util;
let name = os::read_stdin();
print(util::shout(name));
print(os::read_file("nats://r1/data.txt"));
os::write_file("/scratch.txt", "tmp");
print(os::getwd());
exit(4);
"#,
                ),
            ]),
        )
        .await;
    let client = &harness.client;

    let id = client.create_worker().await.unwrap();
    client.wait_worker(id, Duration::from_secs(5)).await.unwrap();
    let mut stdout = client.subscribe_stdout(id).await.unwrap();
    client
        .write_stdin(id, Bytes::from_static(b"vessel"))
        .await
        .unwrap();

    let code = client.execute(id, "r1", "/scripts/io.fzz").await.unwrap();
    assert_eq!(code, 4);

    let mut out = Vec::new();
    while !String::from_utf8_lossy(&out).ends_with("mem:///\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stdout.next())
            .await
            .unwrap()
            .unwrap();
        out.extend_from_slice(&chunk.payload);
    }
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "VESSEL\nfrom repo\nmem:///\n"
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_execution_keeps_worker() {
    let harness = Harness::start().await;
    harness
        .put("/scripts/bad.fzz", bundle(&[("main.risor", r#"throw "nope";"#)]))
        .await;
    let client = &harness.client;
    let id = client.create_worker().await.unwrap();
    client.wait_worker(id, Duration::from_secs(5)).await.unwrap();

    let err = client.execute(id, "r1", "/scripts/missing.fzz").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::RepositoryGetFile));
    let err = client.execute(id, "r1", "/scripts/bad.fzz").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::EngineRun));
    assert!(err.to_string().contains("nope"));

    harness
        .put("/scripts/ok.fzz", bundle(&[("main.risor", "let x = 1;")]))
        .await;
    assert_eq!(client.execute(id, "r1", "/scripts/ok.fzz").await.unwrap(), 0);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_drains_running_workers() {
    let harness = Harness::start().await;
    harness
        .put(
            "/scripts/spin.fzz",
            bundle(&[("main.risor", "let n = 0; loop { n += 1; }")]),
        )
        .await;

    let mut calls = Vec::new();
    for _ in 0..5 {
        let id = harness.client.create_worker().await.unwrap();
        harness
            .client
            .wait_worker(id, Duration::from_secs(5))
            .await
            .unwrap();
        let client = harness.client.clone();
        calls.push(tokio::spawn(async move {
            client.execute(id, "r1", "/scripts/spin.fzz").await
        }));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = harness.stop().await;
    assert_eq!(summary, SchedulerSummary { created: 5, stopped: 5 });
    for call in calls {
        // interrupted executions fail one way or another
        assert!(call.await.unwrap().is_err());
    }
}
