//! [`RemoteTransport`] over the system `ssh` client.
//!
//! Every call is one `ssh` process; a control master keeps the connection
//! open between calls. Commands run through `sudo -n` when the login user is
//! not root.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use itertools::Itertools;
use log::{debug, info, warn};
use tokio::{io::AsyncWriteExt, process::Command, time::sleep};

use crate::{
    config::ServerConfig,
    domain::{
        error::{GardenError, TransportError},
        lock,
        port::{CommandOutput, RegistryLock, RemoteTransport},
        remote::{argv, quote, sh},
    },
};

/// `ssh` exits with 255 when the connection itself fails.
const SSH_FAILURE: i32 = 255;
const CONNECT_ATTEMPTS: u32 = 3;
/// Exit code of the read script when the file is absent.
const MISSING_EXIT: i32 = 44;

pub struct SshTransport {
    host: String,
    user: String,
    key: Option<PathBuf>,
    sudo: bool,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key: Option<PathBuf>) -> Self {
        let user = user.into();
        SshTransport {
            host: host.into(),
            sudo: user != "root",
            user,
            key,
        }
    }

    /// Connects to a configured server, asking `hcloud` for its address when
    /// it is named by Hetzner Cloud server name.
    pub async fn connect(server: &ServerConfig) -> Result<Self, TransportError> {
        let host = match (&server.host, &server.hcloud_name, &server.hcloud_context) {
            (Some(host), _, _) => host.clone(),
            (None, Some(name), Some(context)) => hcloud_ip(name, context).await?,
            _ => {
                return Err(TransportError::Connection {
                    host: "?".to_string(),
                    detail: "server has no host and no hcloud_name/hcloud_context".to_string(),
                })
            }
        };
        let key = server.ssh_key.as_deref().map(expand_home);
        Ok(SshTransport::new(host, server.ssh_user.clone(), key))
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path().display()),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
        ];
        if let Some(key) = &self.key {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }

    fn remote_line(&self, argv: &[String]) -> String {
        let line = argv.iter().map(|arg| quote(arg)).join(" ");
        if self.sudo {
            format!("sudo -n {line}")
        } else {
            line
        }
    }

    /// Runs `argv` remotely, feeding `stdin` when given. Connection failures
    /// are retried with a growing pause.
    async fn exec(&self, argv: &[String], stdin: Option<Bytes>) -> Result<RawOutput, TransportError> {
        let line = self.remote_line(argv);
        let mut attempt = 1;
        loop {
            debug!("ssh {}: {}", self.host, argv.first().map(String::as_str).unwrap_or_default());
            let output = self.spawn(&line, stdin.clone()).await?;
            if output.code != SSH_FAILURE {
                return Ok(output);
            }
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if attempt >= CONNECT_ATTEMPTS {
                return Err(TransportError::Connection {
                    host: self.host.clone(),
                    detail,
                });
            }
            warn!("Connection to {} failed ({detail}), retrying", self.host);
            sleep(Duration::from_secs(u64::from(attempt))).await;
            attempt += 1;
        }
    }

    async fn spawn(&self, line: &str, stdin: Option<Bytes>) -> Result<RawOutput, TransportError> {
        let mut child = Command::new("ssh")
            .args(self.ssh_args())
            .arg("--")
            .arg(line)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&bytes).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        Ok(RawOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            code: output.status.code().unwrap_or(SSH_FAILURE),
        })
    }
}

struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: i32,
}

impl From<RawOutput> for CommandOutput {
    fn from(raw: RawOutput) -> Self {
        CommandOutput {
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
            code: raw.code,
        }
    }
}

fn control_path() -> PathBuf {
    std::env::temp_dir().join("appgarden-ssh-%C")
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), directories::BaseDirs::new()) {
        (Some(rest), Some(dirs)) => dirs.home_dir().join(rest),
        _ => PathBuf::from(path),
    }
}

async fn hcloud_ip(name: &str, context: &str) -> Result<String, TransportError> {
    info!("Resolving {name} with hcloud");
    let output = Command::new("hcloud")
        .args(["--context", context, "server", "ip", name])
        .output()
        .await
        .map_err(|e| TransportError::Connection {
            host: name.to_string(),
            detail: format!("can't run hcloud: {e}"),
        })?;
    let ip = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || ip.is_empty() {
        return Err(TransportError::Connection {
            host: name.to_string(),
            detail: format!(
                "hcloud could not resolve the server: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(ip)
}

/// Packs `local` into a gzipped tar, skipping `.git`, anything matching
/// `exclude` and, with `gitignore`, whatever `.gitignore` files exclude.
pub fn pack(local: &Path, exclude: &[String], gitignore: bool) -> Result<Bytes, TransportError> {
    let excluded = exclusions(exclude)?;
    let root = local.to_path_buf();
    let walker = WalkBuilder::new(local)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_global(false)
        .git_ignore(gitignore)
        .git_exclude(gitignore)
        .require_git(false)
        .filter_entry(move |entry| {
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                return true;
            };
            relative.as_os_str().is_empty()
                || !(entry.file_name() == ".git"
                    || excluded.is_match(relative)
                    || excluded.is_match(entry.file_name()))
        })
        .build();

    let tar_gz = BytesMut::new().writer();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);
    let mut files = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        let relative = match entry.path().strip_prefix(local) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => continue,
        };
        match entry.file_type() {
            Some(kind) if kind.is_dir() => tar.append_dir(&relative, entry.path())?,
            Some(kind) if kind.is_file() => {
                tar.append_path_with_name(entry.path(), &relative)?;
                files += 1;
            }
            _ => debug!("Skipping {}", entry.path().display()),
        }
    }
    let tar_gz = tar.into_inner()?.finish()?;
    debug!("Packed {files} files from {}", local.display());
    Ok(tar_gz.into_inner().freeze())
}

fn exclusions(patterns: &[String]) -> Result<GlobSet, TransportError> {
    let invalid = |e: globset::Error| TransportError::Io(std::io::Error::other(e));
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern.trim_end_matches('/')).map_err(invalid)?);
    }
    builder.build().map_err(invalid)
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        let file = quote(path);
        let output = self
            .exec(
                &sh(format!("if [ -f {file} ]; then cat {file}; else exit {MISSING_EXIT}; fi")),
                None,
            )
            .await?;
        match output.code {
            0 => Ok(output.stdout),
            MISSING_EXIT => Err(TransportError::NotFound(path.to_string())),
            code => Err(TransportError::CommandFailed {
                command: format!("cat {path}"),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), TransportError> {
        let parent = Path::new(path)
            .parent()
            .map(|parent| parent.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let script = format!(
            "mkdir -p {} && cat > {file} && chmod {mode:o} {file}",
            quote(&parent),
            file = quote(path)
        );
        let output = self
            .exec(&sh(script), Some(Bytes::copy_from_slice(contents)))
            .await?;
        if output.code != 0 {
            return Err(TransportError::CommandFailed {
                command: format!("write {path}"),
                code: output.code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, TransportError> {
        self.exec(argv, None).await.map(CommandOutput::from)
    }

    async fn upload_directory(
        &self,
        local: &Path,
        remote: &str,
        exclude: &[String],
        gitignore: bool,
    ) -> Result<(), TransportError> {
        let (source, patterns) = (local.to_path_buf(), exclude.to_vec());
        let archive = tokio::task::spawn_blocking(move || pack(&source, &patterns, gitignore))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;
        info!("Sending {} KiB to {}:{remote}", archive.len() / 1024, self.host);
        let dir = quote(remote);
        let output = self
            .exec(
                &sh(format!("rm -rf {dir} && mkdir -p {dir} && tar -xzf - -C {dir}")),
                Some(archive),
            )
            .await?;
        if output.code != 0 {
            return Err(TransportError::CommandFailed {
                command: format!("unpack into {remote}"),
                code: output.code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<RegistryLock, GardenError> {
        let holder = lock::holder_label();
        lock::acquire(path, timeout, |token| {
            let script = lock::create_script(path, &token, &holder);
            async move {
                let output = self.run_command(&sh(script.clone())).await?;
                lock::interpret(output, &script)
            }
        })
        .await
    }

    async fn release_lock(&self, lock: RegistryLock) -> Result<(), TransportError> {
        self.run(&sh(lock::release_script(&lock))).await.map(|_| ())
    }
}
