//! Script engine façade.
//!
//! [`bootstrap`] compiles the fixed program `import "main";` once per
//! worker. Each execution then runs that program in a fresh rhai engine
//! wired to a [`BundleImporter`] for module lookup and a [`VirtualOs`] for
//! files, environment and standard streams. Errors come back as a single
//! [`EngineError`] whose message points at the offending module and line
//! for syntax errors.

mod importer;
mod os;

use std::sync::Arc;

use common::bundle::BundleError;
use rhai::{Dynamic, EvalAltResult, AST};
use tokio_util::sync::CancellationToken;

pub use importer::BundleImporter;
pub use os::{ScriptFile, VirtualOs};

const BOOTSTRAP: &str = r#"import "main";"#;
const BOOTSTRAP_NAME: &str = "<bootstrap>";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{module}:{line}:{column}: syntax error: {message}")]
    Parse {
        module: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{0}")]
    Runtime(String),
    #[error("script cancelled")]
    Cancelled,
    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Everything a single run needs besides the compiled code.
pub struct RunOptions {
    pub os: Arc<VirtualOs>,
    pub importer: BundleImporter,
    pub cancel: CancellationToken,
}

/// The compiled bootstrap program.
#[derive(Debug, Clone)]
pub struct Code {
    ast: AST,
}

pub fn bootstrap() -> Result<Code, EngineError> {
    let engine = rhai::Engine::new_raw();
    let ast = engine
        .compile(BOOTSTRAP)
        .map_err(|e| EngineError::from_script_error(BOOTSTRAP_NAME, &parse_error(e)))?;
    Ok(Code { ast })
}

impl Code {
    /// Run to completion and return the exit code: 0 unless the script
    /// called `exit`.
    pub fn run(&self, options: RunOptions) -> Result<i64, EngineError> {
        let RunOptions {
            os,
            importer,
            cancel,
        } = options;

        let mut engine = rhai::Engine::new();
        engine.set_module_resolver(importer);
        os.register(&mut engine);

        let stdout = os.stdout();
        engine.on_print(move |text| {
            let mut line = String::with_capacity(text.len() + 1);
            line.push_str(text);
            line.push('\n');
            if stdout.write(line.as_bytes()).is_err() {
                tracing::debug!("stdout closed, dropping script output");
            }
        });
        engine.on_debug(|text, source, pos| {
            tracing::debug!(source = source.unwrap_or(BOOTSTRAP_NAME), %pos, "{text}");
        });
        engine.on_progress(move |_| cancel.is_cancelled().then_some(Dynamic::UNIT));

        match engine.run_ast(&self.ast) {
            Ok(()) => Ok(0),
            Err(err) => match root_cause(&err) {
                EvalAltResult::ErrorTerminated(value, _) => {
                    value.as_int().map_err(|_| EngineError::Cancelled)
                }
                _ => Err(EngineError::from_script_error(BOOTSTRAP_NAME, &err)),
            },
        }
    }
}

impl EngineError {
    fn from_script_error(default_module: &str, err: &EvalAltResult) -> Self {
        match root_cause(err) {
            EvalAltResult::ErrorParsing(kind, pos) => EngineError::Parse {
                module: innermost_module(err).unwrap_or(default_module).to_string(),
                line: pos.line().unwrap_or(0),
                column: pos.position().unwrap_or(0),
                message: kind.to_string(),
            },
            _ => EngineError::Runtime(err.to_string()),
        }
    }
}

pub(crate) fn parse_error(err: rhai::ParseError) -> EvalAltResult {
    EvalAltResult::ErrorParsing(*err.0, err.1)
}

fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInModule(_, inner, _)
        | EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        other => other,
    }
}

fn innermost_module(err: &EvalAltResult) -> Option<&str> {
    match err {
        EvalAltResult::ErrorInModule(name, inner, _) => {
            innermost_module(inner).or(Some(name.as_str()))
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost_module(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use common::vfs::{FileSystem, MemFs, MuxFs};

    use super::*;
    use crate::pipe::{pipe, PipeReader, PipeWriter};
    use crate::testing::bundle;

    struct Harness {
        fs: Arc<MuxFs>,
        stdin: PipeWriter,
        output: PipeReader,
        os: Arc<VirtualOs>,
    }

    fn harness(env: BTreeMap<String, String>, cancel: CancellationToken) -> Harness {
        let fs = Arc::new(
            MuxFs::new()
                .with_backend("mem", Arc::new(MemFs::new()))
                .with_working_dir("mem:///"),
        );
        let (stdin, stdin_reader) = pipe();
        let (stdout, output) = pipe();
        let os = Arc::new(
            VirtualOs::new(
                tokio::runtime::Handle::current(),
                fs.clone(),
                stdin_reader,
                stdout,
                cancel,
            )
            .with_env(env)
            .with_args(vec!["/scripts/test.fzz".to_string()]),
        );
        Harness {
            fs,
            stdin,
            output,
            os,
        }
    }

    async fn run(
        files: &[(&str, &str)],
        harness: &Harness,
        cancel: CancellationToken,
    ) -> Result<i64, EngineError> {
        let code = bootstrap().unwrap();
        let importer = BundleImporter::from_bytes(bundle(files)).unwrap();
        let options = RunOptions {
            os: harness.os.clone(),
            importer,
            cancel,
        };
        tokio::task::spawn_blocking(move || code.run(options))
            .await
            .unwrap()
    }

    fn drain(reader: &PipeReader) -> String {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        while let Some(chunk) = reader.recv_blocking(&cancel) {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_print_reaches_stdout() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let code = run(&[("main.risor", r#"print("hi");"#)], &h, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(drain(&h.output), "hi\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_modules_import_each_other() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let files = [
            ("main.risor", "import \"lib/greet\" as greet;\nprint(greet::hello(\"vessel\"));"),
            ("lib/greet.rsr", "fn hello(name) { `hello ${name}` }"),
        ];
        run(&files, &h, CancellationToken::new()).await.unwrap();
        assert_eq!(drain(&h.output), "hello vessel\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_import_cycle_is_an_error() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let files = [
            ("main.risor", "import \"a\" as a;\nprint(\"main\");"),
            ("a.risor", "import \"b\" as b;\nfn f() { 1 }"),
            ("b.risor", "import \"a\" as a;\nfn g() { 2 }"),
        ];
        let err = run(&files, &h, CancellationToken::new()).await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, EngineError::Runtime(_)));
        assert!(message.contains("import cycle: a -> b -> a"), "{message}");
        assert_eq!(drain(&h.output), "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_self_import_is_an_error() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let err = run(&[("main.risor", "import \"main\" as me;")], &h, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("import cycle: main -> main"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exit_code() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let code = run(
            &[("main.risor", "print(\"bye\");\nexit(3);\nprint(\"unreachable\");")],
            &h,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
        assert_eq!(drain(&h.output), "bye\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_syntax_error_names_module_and_line() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let err = run(&[("main.risor", "let x = 1;\nlet = ;")], &h, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Parse { module, line, .. } => {
                assert_eq!(module, "main.risor");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runtime_error_is_reported() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let err = run(&[("main.risor", "undefined_function(1);")], &h, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime(ref msg) if msg.contains("undefined_function")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_stops_a_loop() {
        let cancel = CancellationToken::new();
        let h = harness(BTreeMap::new(), cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = run(&[("main.risor", "let n = 0;\nloop { n += 1; }")], &h, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_os_module_uses_the_vfs() {
        let mut env = BTreeMap::new();
        env.insert("STAGE".to_string(), "test".to_string());
        let h = harness(env, CancellationToken::new());
        let script = r#"
            os::mkdir_all("/out/logs");
            os::write_file("/out/logs/a.txt", "alpha");
            let f = os::create("/out/b.txt");
            f.write("beta");
            f.close();
            os::rename("/out/b.txt", "/out/c.txt");
            print(os::read_file("/out/logs/a.txt"));
            print(os::stat("/out/c.txt").size);
            let names = [];
            for entry in os::read_dir("/out") { names.push(entry.name); }
            names.sort();
            print(names.len());
            print(names[0]);
            print(os::getenv("STAGE"));
            os::setenv("EXTRA", "1");
            print(os::lookup_env("EXTRA"));
            print(os::args()[0]);
            os::chdir("/out");
            print(os::getwd());
        "#;
        run(&[("main.risor", script)], &h, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            drain(&h.output),
            "alpha\n4\n2\nc.txt\ntest\n1\n/scripts/test.fzz\nmem:///out\n"
        );
        assert_eq!(h.fs.read_file("mem:///out/c.txt").await.unwrap(), b"beta");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_read_is_short() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        h.fs.write_file("mem:///small.txt", b"0123456789", 0o644)
            .await
            .unwrap();
        let script = r#"
            let f = os::open("/small.txt");
            print(f.read(1 << 60).len());
            print(f.read(-5).len());
            f.close();
        "#;
        run(&[("main.risor", script)], &h, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(drain(&h.output), "10\n0\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_vfs_errors_surface_as_runtime_errors() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        let err = run(&[("main.risor", r#"os::read_file("/missing");"#)], &h, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("file does not exist"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stdin_is_readable() {
        let h = harness(BTreeMap::new(), CancellationToken::new());
        h.stdin.write(b"ping").unwrap();
        run(
            &[("main.risor", "let line = os::read_stdin();\nprint(`got ${line}`);")],
            &h,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(drain(&h.output), "got ping\n");
    }
}
