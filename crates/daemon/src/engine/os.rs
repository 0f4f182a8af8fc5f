//! The `os` module scripts see.
//!
//! Every filesystem call goes through the worker's [`MuxFs`], so scripts
//! address `file://`, `mem://` and `nats://` locations uniformly. Scripts
//! run on a blocking thread; async VFS calls are driven on the runtime
//! handle captured at construction and abandoned when the run is cancelled.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use common::urlpath::PathStyle;
use common::vfs::{
    DirEntry, File, FileInfo, FileSystem, MuxFs, OpenFlags, VfsError, VfsResult, WalkControl,
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
};
use parking_lot::Mutex;
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module, Position};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::pipe::{PipeReader, PipeWriter, MAX_CHUNK};

/// Largest buffer a single `File.read` allocates; bigger requests read short.
const MAX_READ: usize = MAX_CHUNK * 16;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

fn runtime_error(err: impl Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(err.to_string()),
        Position::NONE,
    ))
}

fn terminate(value: Dynamic) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(value, Position::NONE))
}

/// Drives VFS futures from the script thread.
#[derive(Debug, Clone)]
struct Blocker {
    handle: Handle,
    cancel: CancellationToken,
}

impl Blocker {
    fn run<T>(&self, fut: impl Future<Output = VfsResult<T>>) -> ScriptResult<T> {
        self.handle.block_on(async {
            tokio::select! {
                result = fut => result.map_err(runtime_error),
                _ = self.cancel.cancelled() => Err(terminate(Dynamic::UNIT)),
            }
        })
    }
}

fn info_map(info: &FileInfo) -> Map {
    let mut map = Map::new();
    map.insert("name".into(), Dynamic::from(info.name.clone()));
    map.insert("size".into(), Dynamic::from(info.size as i64));
    map.insert("mode".into(), Dynamic::from(info.mode as i64));
    map.insert(
        "modified".into(),
        Dynamic::from(info.modified.to_rfc3339()),
    );
    map.insert("is_dir".into(), Dynamic::from(info.is_dir()));
    map.insert("is_symlink".into(), Dynamic::from(info.is_symlink()));
    if let Some(target) = &info.symlink_target {
        map.insert("target".into(), Dynamic::from(target.clone()));
    }
    map
}

fn perm(value: i64) -> ScriptResult<u32> {
    u32::try_from(value).map_err(|_| runtime_error(format!("invalid permission bits: {value}")))
}

/// An open file handle exposed to scripts as `File`.
#[derive(Debug, Clone)]
pub struct ScriptFile {
    file: Arc<Mutex<Option<Box<dyn File>>>>,
    blocker: Blocker,
}

impl ScriptFile {
    fn new(file: Box<dyn File>, blocker: Blocker) -> Self {
        Self {
            file: Arc::new(Mutex::new(Some(file))),
            blocker,
        }
    }

    fn read(&mut self, len: i64) -> ScriptResult<Blob> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| runtime_error(VfsError::Closed))?;
        let len = usize::try_from(len).unwrap_or(0).min(MAX_READ);
        let mut buf = vec![0u8; len];
        let read = self.blocker.run(file.read(&mut buf))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn read_all(&mut self) -> ScriptResult<String> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| runtime_error(VfsError::Closed))?;
        let data = self.blocker.run(file.read_to_end())?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn write(&mut self, data: &[u8]) -> ScriptResult<i64> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| runtime_error(VfsError::Closed))?;
        self.blocker.run(file.write_all(data))?;
        Ok(data.len() as i64)
    }

    fn stat(&mut self) -> ScriptResult<Map> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or_else(|| runtime_error(VfsError::Closed))?;
        let info = self.blocker.run(file.stat())?;
        Ok(info_map(&info))
    }

    fn close(&mut self) -> ScriptResult<()> {
        let file = self.file.lock().take();
        match file {
            Some(mut file) => self.blocker.run(file.close()),
            None => Err(runtime_error(VfsError::Closed)),
        }
    }
}

/// Operating system surface of one script run.
#[derive(Debug)]
pub struct VirtualOs {
    fs: Arc<MuxFs>,
    blocker: Blocker,
    env: Mutex<BTreeMap<String, String>>,
    args: Vec<String>,
    stdin: PipeReader,
    stdout: PipeWriter,
}

impl VirtualOs {
    pub fn new(
        handle: Handle,
        fs: Arc<MuxFs>,
        stdin: PipeReader,
        stdout: PipeWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fs,
            blocker: Blocker { handle, cancel },
            env: Mutex::new(BTreeMap::new()),
            args: Vec::new(),
            stdin,
            stdout,
        }
    }

    pub fn with_env(self, env: BTreeMap<String, String>) -> Self {
        *self.env.lock() = env;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn stdout(&self) -> PipeWriter {
        self.stdout.clone()
    }

    fn file(&self, file: Box<dyn File>) -> ScriptFile {
        ScriptFile::new(file, self.blocker.clone())
    }

    fn create(&self, path: &str) -> ScriptResult<ScriptFile> {
        Ok(self.file(self.blocker.run(self.fs.create(path))?))
    }

    fn open(&self, path: &str) -> ScriptResult<ScriptFile> {
        Ok(self.file(self.blocker.run(self.fs.open(path))?))
    }

    fn open_file(&self, path: &str, flags: i64, mode: i64) -> ScriptResult<ScriptFile> {
        let flags = u32::try_from(flags)
            .ok()
            .and_then(OpenFlags::from_bits)
            .ok_or_else(|| runtime_error(format!("invalid open flags: {flags}")))?;
        let mode = perm(mode)?;
        Ok(self.file(self.blocker.run(self.fs.open_file(path, flags, mode))?))
    }

    fn read_file(&self, path: &str) -> ScriptResult<String> {
        let data = self.blocker.run(self.fs.read_file(path))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn write_file(&self, path: &str, data: &[u8], mode: i64) -> ScriptResult<()> {
        let mode = perm(mode)?;
        self.blocker.run(self.fs.write_file(path, data, mode))
    }

    fn mkdir(&self, path: &str, mode: i64) -> ScriptResult<()> {
        let mode = perm(mode)?;
        self.blocker.run(self.fs.mkdir(path, mode))
    }

    fn mkdir_all(&self, path: &str, mode: i64) -> ScriptResult<()> {
        let mode = perm(mode)?;
        self.blocker.run(self.fs.mkdir_all(path, mode))
    }

    fn remove(&self, path: &str) -> ScriptResult<()> {
        self.blocker.run(self.fs.remove(path))
    }

    fn remove_all(&self, path: &str) -> ScriptResult<()> {
        self.blocker.run(self.fs.remove_all(path))
    }

    fn rename(&self, old: &str, new: &str) -> ScriptResult<()> {
        self.blocker.run(self.fs.rename(old, new))
    }

    fn symlink(&self, old: &str, new: &str) -> ScriptResult<()> {
        self.blocker.run(self.fs.symlink(old, new))
    }

    fn stat(&self, path: &str) -> ScriptResult<Map> {
        let info = self.blocker.run(self.fs.stat(path))?;
        Ok(info_map(&info))
    }

    fn read_dir(&self, path: &str) -> ScriptResult<Array> {
        let entries = self.blocker.run(self.fs.read_dir(path))?;
        Ok(entries
            .iter()
            .map(|entry| Dynamic::from(info_map(entry)))
            .collect())
    }

    /// Every path under `root`, depth first, each entry carrying a `path`.
    fn walk_dir(&self, root: &str) -> ScriptResult<Array> {
        let mut visited = Vec::new();
        self.blocker.run(async {
            self.fs
                .walk_dir(root, &mut |path: &str, info: &DirEntry| {
                    visited.push((path.to_string(), info.clone()));
                    Ok(WalkControl::Continue)
                })
                .await
        })?;
        Ok(visited
            .into_iter()
            .map(|(path, info)| {
                let mut map = info_map(&info);
                map.insert("path".into(), Dynamic::from(path));
                Dynamic::from(map)
            })
            .collect())
    }

    fn chdir(&self, path: &str) -> ScriptResult<()> {
        self.blocker.run(self.fs.chdir(path))
    }

    fn getenv(&self, key: &str) -> String {
        self.env.lock().get(key).cloned().unwrap_or_default()
    }

    fn lookup_env(&self, key: &str) -> Dynamic {
        match self.env.lock().get(key) {
            Some(value) => Dynamic::from(value.clone()),
            None => Dynamic::UNIT,
        }
    }

    fn environ(&self) -> Array {
        self.env
            .lock()
            .iter()
            .map(|(k, v)| Dynamic::from(format!("{k}={v}")))
            .collect()
    }

    /// Next chunk of stdin; empty once stdin is closed.
    fn read_stdin(&self) -> String {
        match self.stdin.recv_blocking(&self.blocker.cancel) {
            Some(chunk) => String::from_utf8_lossy(&chunk).into_owned(),
            None => String::new(),
        }
    }

    fn write_stdout(&self, data: &[u8]) -> ScriptResult<i64> {
        let written = self.stdout.write(data).map_err(runtime_error)?;
        Ok(written as i64)
    }

    /// Install the `os` module, the `File` type and `exit` into `engine`.
    pub fn register(self: &Arc<Self>, engine: &mut Engine) {
        engine
            .register_type_with_name::<ScriptFile>("File")
            .register_fn("read", |f: &mut ScriptFile, len: i64| f.read(len))
            .register_fn("read_all", |f: &mut ScriptFile| f.read_all())
            .register_fn("write", |f: &mut ScriptFile, data: ImmutableString| {
                f.write(data.as_bytes())
            })
            .register_fn("write", |f: &mut ScriptFile, data: Blob| f.write(&data))
            .register_fn("stat", |f: &mut ScriptFile| f.stat())
            .register_fn("close", |f: &mut ScriptFile| f.close())
            .register_fn("exit", |code: i64| -> ScriptResult<()> {
                Err(terminate(Dynamic::from(code)))
            });
        engine.register_static_module("os", self.module().into());
    }

    fn module(self: &Arc<Self>) -> Module {
        let mut m = Module::new();
        let style = PathStyle::native();

        m.set_var("O_RDONLY", OpenFlags::READ_ONLY.bits() as i64);
        m.set_var("O_WRONLY", OpenFlags::WRITE_ONLY.bits() as i64);
        m.set_var("O_RDWR", OpenFlags::READ_WRITE.bits() as i64);
        m.set_var("O_APPEND", OpenFlags::APPEND.bits() as i64);
        m.set_var("O_CREATE", OpenFlags::CREATE.bits() as i64);
        m.set_var("O_EXCL", OpenFlags::EXCLUSIVE.bits() as i64);
        m.set_var("O_TRUNC", OpenFlags::TRUNCATE.bits() as i64);

        let os = self.clone();
        m.set_native_fn("create", move |path: ImmutableString| os.create(&path));
        let os = self.clone();
        m.set_native_fn("open", move |path: ImmutableString| os.open(&path));
        let os = self.clone();
        m.set_native_fn(
            "open_file",
            move |path: ImmutableString, flags: i64, mode: i64| os.open_file(&path, flags, mode),
        );
        let os = self.clone();
        m.set_native_fn("read_file", move |path: ImmutableString| os.read_file(&path));
        let os = self.clone();
        m.set_native_fn("write_file", move |path: ImmutableString, data: ImmutableString| {
            os.write_file(&path, data.as_bytes(), DEFAULT_FILE_MODE as i64)
        });
        let os = self.clone();
        m.set_native_fn("write_file", move |path: ImmutableString, data: Blob| {
            os.write_file(&path, &data, DEFAULT_FILE_MODE as i64)
        });
        let os = self.clone();
        m.set_native_fn(
            "write_file",
            move |path: ImmutableString, data: ImmutableString, mode: i64| {
                os.write_file(&path, data.as_bytes(), mode)
            },
        );
        let os = self.clone();
        m.set_native_fn("mkdir", move |path: ImmutableString| {
            os.mkdir(&path, DEFAULT_DIR_MODE as i64)
        });
        let os = self.clone();
        m.set_native_fn("mkdir", move |path: ImmutableString, mode: i64| {
            os.mkdir(&path, mode)
        });
        let os = self.clone();
        m.set_native_fn("mkdir_all", move |path: ImmutableString| {
            os.mkdir_all(&path, DEFAULT_DIR_MODE as i64)
        });
        let os = self.clone();
        m.set_native_fn("mkdir_all", move |path: ImmutableString, mode: i64| {
            os.mkdir_all(&path, mode)
        });
        let os = self.clone();
        m.set_native_fn("remove", move |path: ImmutableString| os.remove(&path));
        let os = self.clone();
        m.set_native_fn("remove_all", move |path: ImmutableString| os.remove_all(&path));
        let os = self.clone();
        m.set_native_fn("rename", move |old: ImmutableString, new: ImmutableString| {
            os.rename(&old, &new)
        });
        let os = self.clone();
        m.set_native_fn("symlink", move |old: ImmutableString, new: ImmutableString| {
            os.symlink(&old, &new)
        });
        let os = self.clone();
        m.set_native_fn("stat", move |path: ImmutableString| os.stat(&path));
        let os = self.clone();
        m.set_native_fn("read_dir", move |path: ImmutableString| os.read_dir(&path));
        let os = self.clone();
        m.set_native_fn("walk_dir", move |root: ImmutableString| os.walk_dir(&root));

        let os = self.clone();
        m.set_native_fn("getwd", move || -> ScriptResult<String> { Ok(os.fs.getwd()) });
        let os = self.clone();
        m.set_native_fn("chdir", move |path: ImmutableString| os.chdir(&path));

        let os = self.clone();
        m.set_native_fn("getenv", move |key: ImmutableString| -> ScriptResult<String> {
            Ok(os.getenv(&key))
        });
        let os = self.clone();
        m.set_native_fn(
            "setenv",
            move |key: ImmutableString, value: ImmutableString| -> ScriptResult<()> {
                os.env.lock().insert(key.to_string(), value.to_string());
                Ok(())
            },
        );
        let os = self.clone();
        m.set_native_fn("unsetenv", move |key: ImmutableString| -> ScriptResult<()> {
            os.env.lock().remove(key.as_str());
            Ok(())
        });
        let os = self.clone();
        m.set_native_fn("lookup_env", move |key: ImmutableString| -> ScriptResult<Dynamic> {
            Ok(os.lookup_env(&key))
        });
        let os = self.clone();
        m.set_native_fn("environ", move || -> ScriptResult<Array> { Ok(os.environ()) });
        let os = self.clone();
        m.set_native_fn("args", move || -> ScriptResult<Array> {
            Ok(os.args.iter().cloned().map(Dynamic::from).collect())
        });

        let os = self.clone();
        m.set_native_fn("read_stdin", move || -> ScriptResult<String> {
            Ok(os.read_stdin())
        });
        let os = self.clone();
        m.set_native_fn("write_stdout", move |data: ImmutableString| {
            os.write_stdout(data.as_bytes())
        });
        let os = self.clone();
        m.set_native_fn("write_stdout", move |data: Blob| os.write_stdout(&data));
        m.set_native_fn("exit", |code: i64| -> ScriptResult<()> {
            Err(terminate(Dynamic::from(code)))
        });

        m.set_native_fn("path_separator", move || -> ScriptResult<String> {
            Ok(style.separator().to_string())
        });
        m.set_native_fn("path_list_separator", move || -> ScriptResult<String> {
            Ok(style.list_separator().to_string())
        });

        m
    }
}
