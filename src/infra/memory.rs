//! In-memory transport for tests: a fake remote filesystem plus a command log.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::domain::{
    error::{GardenError, TransportError},
    lock::{self, LockAttempt},
    port::{CommandOutput, RegistryLock, RemoteTransport},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    pub local: PathBuf,
    pub remote: String,
    pub exclude: Vec<String>,
    pub gitignore: bool,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, (Vec<u8>, u32)>,
    reads: BTreeMap<String, usize>,
    commands: Vec<String>,
    responses: Vec<(String, CommandOutput)>,
    failing_writes: Vec<String>,
    locks: BTreeMap<String, (String, String)>,
    uploads: Vec<Upload>,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn put(&self, path: &str, contents: &str) {
        self.with(|s| s.files.insert(path.to_string(), (contents.as_bytes().to_vec(), 0o644)));
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.with(|s| {
            s.files
                .get(path)
                .map(|(bytes, _)| String::from_utf8_lossy(bytes).into_owned())
        })
    }

    pub fn json(&self, path: &str) -> serde_json::Value {
        self.text(path)
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.with(|s| s.files.get(path).map(|(_, mode)| *mode))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.with(|s| s.files.contains_key(path))
    }

    pub fn files(&self) -> Vec<String> {
        self.with(|s| s.files.keys().cloned().collect())
    }

    pub fn reads(&self, path: &str) -> usize {
        self.with(|s| s.reads.get(path).copied().unwrap_or_default())
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.commands.clone())
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.with(|s| s.uploads.clone())
    }

    /// Any command containing `pattern` returns `output`. Later responses win.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.with(|s| s.responses.push((pattern.to_string(), output)));
    }

    pub fn fail_command(&self, pattern: &str) {
        self.respond(
            pattern,
            CommandOutput {
                stdout: String::new(),
                stderr: format!("{pattern}: simulated failure"),
                code: 1,
            },
        );
    }

    pub fn fail_writes_to(&self, prefix: &str) {
        self.with(|s| s.failing_writes.push(prefix.to_string()));
    }

    pub fn hold_lock(&self, path: &str, holder: &str) {
        self.with(|s| {
            s.locks
                .insert(path.to_string(), ("foreign".to_string(), holder.to_string()))
        });
    }

    pub fn lock_held(&self, path: &str) -> bool {
        self.with(|s| s.locks.contains_key(path))
    }

    /// Replays the file effects of `sh -c` scripts and plain commands. Other
    /// commands succeed without effect.
    fn interpret(state: &mut State, argv: &[String]) -> CommandOutput {
        match argv {
            [sh, flag, script] if sh == "sh" && flag == "-c" => {
                for step in script.split(" && ") {
                    let words: Vec<String> = step.split_whitespace().map(unquote).collect();
                    let output = Self::step(state, &words);
                    if !output.success() {
                        return output;
                    }
                }
                CommandOutput::default()
            }
            words => Self::step(state, words),
        }
    }

    fn step(state: &mut State, words: &[String]) -> CommandOutput {
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["mv", "-f", from, to] => match state.files.remove(*from) {
                Some(file) => {
                    state.files.insert(to.to_string(), file);
                }
                None => {
                    return CommandOutput {
                        stderr: format!("mv: cannot stat '{from}'"),
                        code: 1,
                        ..Default::default()
                    }
                }
            },
            ["rm", "-f", paths @ ..] => {
                for path in paths {
                    state.files.remove(*path);
                }
            }
            ["rm", "-rf", paths @ ..] => {
                for path in paths {
                    state.locks.remove(*path);
                    let dir = format!("{path}/");
                    state
                        .files
                        .retain(|file, _| file.as_str() != *path && !file.starts_with(&dir));
                }
            }
            ["test", "-f", path] if !state.files.contains_key(*path) => {
                return CommandOutput {
                    code: 1,
                    ..Default::default()
                }
            }
            _ => {}
        }
        CommandOutput::default()
    }
}

fn unquote(word: &str) -> String {
    word.strip_prefix('\'')
        .and_then(|word| word.strip_suffix('\''))
        .unwrap_or(word)
        .to_string()
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    fn host(&self) -> &str {
        "memory"
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.with(|s| {
            *s.reads.entry(path.to_string()).or_default() += 1;
            s.files
                .get(path)
                .map(|(bytes, _)| bytes.clone())
                .ok_or_else(|| TransportError::NotFound(path.to_string()))
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), TransportError> {
        self.with(|s| {
            if s.failing_writes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                return Err(TransportError::CommandFailed {
                    command: format!("write {path}"),
                    code: 1,
                    stderr: "simulated write failure".to_string(),
                });
            }
            s.files.insert(path.to_string(), (contents.to_vec(), mode));
            Ok(())
        })
    }

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, TransportError> {
        self.with(|s| {
            let line = argv.join(" ");
            s.commands.push(line.clone());
            let scripted = s
                .responses
                .iter()
                .rev()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, output)| output.clone());
            Ok(match scripted {
                Some(output) => output,
                None => Self::interpret(s, argv),
            })
        })
    }

    async fn upload_directory(
        &self,
        local: &Path,
        remote: &str,
        exclude: &[String],
        gitignore: bool,
    ) -> Result<(), TransportError> {
        self.with(|s| {
            s.commands.push(format!("upload {} {remote}", local.display()));
            s.uploads.push(Upload {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                exclude: exclude.to_vec(),
                gitignore,
            });
        });
        Ok(())
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<RegistryLock, GardenError> {
        lock::acquire(path, timeout, |token| {
            let attempt = self.with(|s| match s.locks.get(path) {
                Some((_, holder)) => LockAttempt::Held(Some(holder.clone())),
                None => {
                    s.locks
                        .insert(path.to_string(), (token, "test pid 1".to_string()));
                    LockAttempt::Acquired
                }
            });
            async move { Ok(attempt) }
        })
        .await
    }

    async fn release_lock(&self, lock: RegistryLock) -> Result<(), TransportError> {
        self.with(|s| match s.locks.get(&lock.path) {
            Some((token, _)) if *token == lock.token => {
                s.locks.remove(&lock.path);
                Ok(())
            }
            _ => Err(TransportError::CommandFailed {
                command: format!("release {}", lock.path),
                code: 1,
                stderr: "registry lock is no longer held by this invocation".to_string(),
            }),
        })
    }
}
