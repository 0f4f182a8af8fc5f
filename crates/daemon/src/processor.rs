//! Executes bundles for one worker.
//!
//! Execute requests are handled one at a time in arrival order. Stdin bytes
//! are fed to the script through a pipe that lives as long as the worker,
//! and everything the script writes to stdout is forwarded, in order, to the
//! publisher.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use common::protocol::{ErrorCode, ExecuteRequest, ExecuteResponse, RpcError, WorkerRequest, WorkerResponse};
use common::vfs::MuxFs;
use object_store::RepositoryClient;
use tokio_util::sync::CancellationToken;

use crate::decoder::{Inbound, Outbound};
use crate::engine::{BundleImporter, Code, EngineError, RunOptions, VirtualOs};
use crate::pipe::{bounded_pipe, pipe, PipeReader, PipeWriter};
use crate::STAGE_BUFFER;

#[derive(Debug)]
pub struct Processor {
    worker_id: u64,
    repos: RepositoryClient,
    fs: Arc<MuxFs>,
    code: Code,
    env: BTreeMap<String, String>,
}

impl Processor {
    pub fn new(worker_id: u64, repos: RepositoryClient, fs: Arc<MuxFs>, code: Code) -> Self {
        Self {
            worker_id,
            repos,
            fs,
            code,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub async fn run(
        self,
        requests: flume::Receiver<Inbound<WorkerRequest>>,
        responses: flume::Sender<Outbound<WorkerResponse>>,
        stdin: flume::Receiver<Bytes>,
        stdout: flume::Sender<Bytes>,
        cancel: CancellationToken,
    ) {
        let (stdin_writer, stdin_reader) = pipe();
        let (stdout_writer, stdout_reader) = bounded_pipe(STAGE_BUFFER);
        let stdin_task = tokio::spawn(feed_stdin(stdin, stdin_writer, cancel.clone()));
        let stdout_task = tokio::spawn(drain_stdout(stdout_reader, stdout));

        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => break,
                inbound = requests.recv_async() => match inbound {
                    Ok(inbound) => inbound,
                    Err(_) => break,
                },
            };
            let result = match &inbound.request {
                WorkerRequest::Execute(request) => self
                    .execute(request, &stdin_reader, &stdout_writer, &cancel)
                    .await
                    .map(WorkerResponse::from),
            };
            if responses.send(inbound.respond(result)).is_err() {
                tracing::debug!(worker_id = self.worker_id, "decoder gone, dropping reply");
            }
        }

        // closing our pipe ends lets the auxiliary loops drain and exit
        drop(stdout_writer);
        drop(stdin_reader);
        for task in [stdin_task, stdout_task] {
            if let Err(e) = task.await {
                tracing::warn!(worker_id = self.worker_id, error = %e, "pipe task failed");
            }
        }
    }

    async fn execute(
        &self,
        request: &ExecuteRequest,
        stdin: &PipeReader,
        stdout: &PipeWriter,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResponse, RpcError> {
        tracing::info!(
            worker_id = self.worker_id,
            repository = %request.repository,
            path = %request.file_path,
            "executing bundle"
        );
        let data = self
            .repos
            .get_file(&request.repository, &request.file_path)
            .await
            .map_err(|e| {
                tracing::warn!(worker_id = self.worker_id, error = %e, "failed to fetch bundle");
                ErrorCode::RepositoryGetFile.with_detail(e)
            })?;

        let result = match BundleImporter::from_bytes(data) {
            Ok(importer) => self.run_script(importer, request, stdin, stdout, cancel).await,
            Err(e) => Err(EngineError::from(e)),
        };
        match result {
            Ok(code) => {
                tracing::info!(worker_id = self.worker_id, code, "bundle finished");
                Ok(ExecuteResponse { code })
            }
            Err(e) => {
                tracing::info!(worker_id = self.worker_id, error = %e, "bundle failed");
                if stdout.send(Bytes::from(format!("{e}\n"))).await.is_err() {
                    tracing::debug!(worker_id = self.worker_id, "stdout closed");
                }
                Err(ErrorCode::EngineRun.with_detail(e))
            }
        }
    }

    async fn run_script(
        &self,
        importer: BundleImporter,
        request: &ExecuteRequest,
        stdin: &PipeReader,
        stdout: &PipeWriter,
        cancel: &CancellationToken,
    ) -> Result<i64, EngineError> {
        let os = VirtualOs::new(
            tokio::runtime::Handle::current(),
            self.fs.clone(),
            stdin.clone(),
            stdout.clone(),
            cancel.clone(),
        )
        .with_env(self.env.clone())
        .with_args(vec![request.file_path.clone()]);
        let options = RunOptions {
            os: Arc::new(os),
            importer,
            cancel: cancel.clone(),
        };
        let code = self.code.clone();
        match tokio::task::spawn_blocking(move || code.run(options)).await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Runtime(format!("script thread failed: {e}"))),
        }
    }
}

async fn feed_stdin(stdin: flume::Receiver<Bytes>, pipe: PipeWriter, cancel: CancellationToken) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stdin.recv_async() => match chunk {
                Ok(chunk) => chunk,
                Err(_) => break,
            },
        };
        if pipe.send(chunk).await.is_err() {
            break;
        }
    }
}

async fn drain_stdout(pipe: PipeReader, stdout: flume::Sender<Bytes>) {
    while let Some(chunk) = pipe.recv().await {
        if stdout.send_async(chunk).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use common::bus::{Bus, MemoryBus};
    use common::vfs::MemFs;

    use super::*;
    use crate::engine::bootstrap;
    use crate::testing::{bundle, detached_request};

    struct Rig {
        requests: flume::Sender<Inbound<WorkerRequest>>,
        responses: flume::Receiver<Outbound<WorkerResponse>>,
        stdin: flume::Sender<Bytes>,
        stdout: flume::Receiver<Bytes>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    impl Rig {
        async fn execute(&self, repository: &str, file_path: &str) -> Result<WorkerResponse, RpcError> {
            let request = ExecuteRequest {
                repository: repository.to_string(),
                file_path: file_path.to_string(),
            };
            self.requests
                .send_async(Inbound {
                    request: request.into(),
                    reply: detached_request("data"),
                })
                .await
                .unwrap();
            self.responses.recv_async().await.unwrap().result
        }

        async fn output_until(&self, expected: &str) -> String {
            let mut out = Vec::new();
            while !String::from_utf8_lossy(&out).contains(expected) {
                out.extend_from_slice(&self.stdout.recv_async().await.unwrap());
            }
            String::from_utf8(out).unwrap()
        }
    }

    async fn rig(files: &[(&str, &str)]) -> Rig {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let repos = RepositoryClient::new(bus);
        repos.create_repository("r1").await.unwrap();
        repos
            .put_file("r1", "/scripts/hello.fzz", bundle(files))
            .await
            .unwrap();
        repos
            .put_file("r1", "/scripts/broken.fzz", Bytes::from_static(b"not a zip"))
            .await
            .unwrap();

        let fs = Arc::new(MuxFs::new().with_backend("mem", Arc::new(MemFs::new())));
        let processor = Processor::new(1, repos, fs, bootstrap().unwrap());
        let (req_tx, req_rx) = flume::bounded(1);
        let (resp_tx, resp_rx) = flume::unbounded();
        let (stdin_tx, stdin_rx) = flume::bounded(4);
        let (stdout_tx, stdout_rx) = flume::bounded(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(processor.run(req_rx, resp_tx, stdin_rx, stdout_tx, cancel.clone()));
        Rig {
            requests: req_tx,
            responses: resp_rx,
            stdin: stdin_tx,
            stdout: stdout_rx,
            cancel,
            task,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_prints_and_succeeds() {
        let rig = rig(&[("main.risor", r#"print("hi");"#)]).await;
        let response = rig.execute("r1", "/scripts/hello.fzz").await.unwrap();
        assert_eq!(response, WorkerResponse::Execute(ExecuteResponse { code: 0 }));
        assert_eq!(rig.output_until("hi\n").await, "hi\n");

        rig.cancel.cancel();
        rig.task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_bundle_reports_repository_error() {
        let rig = rig(&[("main.risor", "")]).await;
        let err = rig.execute("r1", "/scripts/nope.fzz").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RepositoryGetFile);
        let err = rig.execute("r2", "/scripts/hello.fzz").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RepositoryGetFile);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_script_errors_go_to_stdout_and_worker_survives() {
        let rig = rig(&[("main.risor", "let x = ;")]).await;
        let err = rig.execute("r1", "/scripts/hello.fzz").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineRun);
        assert!(err.description.contains("syntax error"));
        assert!(rig.output_until("syntax error").await.contains("main.risor"));

        let err = rig.execute("r1", "/scripts/broken.fzz").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineRun);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stdin_reaches_the_script() {
        let rig = rig(&[(
            "main.risor",
            "let name = os::read_stdin();\nprint(`hello ${name}`);\nexit(7);",
        )])
        .await;
        rig.stdin.send_async(Bytes::from_static(b"op")).await.unwrap();
        let response = rig.execute("r1", "/scripts/hello.fzz").await.unwrap();
        assert_eq!(response, WorkerResponse::Execute(ExecuteResponse { code: 7 }));
        assert_eq!(rig.output_until("hello op\n").await, "hello op\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_interrupts_running_script() {
        let rig = rig(&[("main.risor", "let line = os::read_stdin();")]).await;
        let requests = rig.requests.clone();
        requests
            .send_async(Inbound {
                request: ExecuteRequest {
                    repository: "r1".to_string(),
                    file_path: "/scripts/hello.fzz".to_string(),
                }
                .into(),
                reply: detached_request("data"),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        rig.cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), rig.task)
            .await
            .unwrap()
            .unwrap();
    }
}
