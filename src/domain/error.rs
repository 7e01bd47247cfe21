use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

use super::Stage;

/// Local configuration problems. Never retryable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("routing is ambiguous: {0} are all set, keep exactly one of url, subdomain or path")]
    AmbiguousRouting(String),
    #[error("no routing configured: set one of url, subdomain or path")]
    MissingRouting,
    #[error("method `{method}` requires `{field}`")]
    MissingRequiredField { method: String, field: &'static str },
    #[error("`{0}` is required")]
    MissingField(&'static str),
    #[error("invalid app name `{0}`: use lowercase letters, digits and dashes, starting with a letter or digit")]
    InvalidAppName(String),
    #[error("unknown placeholder `{{{0}}}`")]
    UnknownPlaceholder(String),
    #[error("{layer} layer: `{field}` {detail}")]
    TypeMismatch {
        layer: String,
        field: String,
        detail: String,
    },
    #[error("unknown method `{0}` (expected static, command, dockerfile, docker-compose or auto)")]
    UnknownMethod(String),
    #[error("environment `{name}` not found in appgarden.toml (available: {available})")]
    UnknownEnvironment { name: String, available: String },
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("no appgarden.toml found in {}", .0.display())]
    ProjectNotFound(PathBuf),
    #[error("invalid appgarden.toml: {0}")]
    InvalidProject(String),
    #[error("server `{0}` not found in configuration")]
    UnknownServer(String),
    #[error("no server specified and no default server configured")]
    NoServer,
    #[error("server `{name}`: {detail}")]
    InvalidServer { name: String, detail: String },
    #[error("source directory {} does not exist", .0.display())]
    SourceNotFound(PathBuf),
    #[error("could not detect a runtime for `{0}`; add a Dockerfile and use method dockerfile")]
    RuntimeNotDetected(String),
    #[error("app `{0}` is static and has no service")]
    NoService(String),
}

/// Conflicts with the remote state. Retryable by re-invoking the command.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("port {0} is in use on the server by a process appgarden does not manage")]
    PortConflict(u16),
    #[error("port {port} is already allocated to `{owner}`")]
    PortAlreadyOwned { port: u16, owner: String },
    #[error("port pool exhausted")]
    PortPoolExhausted,
    #[error("timed out after {}s waiting for registry lock {path}{}", .waited.as_secs(), holder_suffix(.holder))]
    LockTimeout {
        path: String,
        waited: Duration,
        holder: Option<String>,
    },
    #[error("registry changed while deploying: {0}; re-run the command")]
    StaleRead(String),
    #[error("route {route} is already served by `{owner}`")]
    RouteConflict { route: String, owner: String },
    #[error("app `{0}` not found")]
    AppNotFound(String),
    #[error("{path} is not a valid document: {detail}")]
    CorruptDocument { path: String, detail: String },
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|holder| format!(" (held by {holder})"))
        .unwrap_or_default()
}

/// Failures of the remote channel, surfaced verbatim.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach {host}: {detail}")]
    Connection { host: String, detail: String },
    #[error("remote command failed (exit {code}): {command}\n{stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum GardenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("template {template}: {detail}")]
    Render { template: String, detail: String },
    #[error("{stage} failed: {cause}")]
    Failed {
        stage: Stage,
        #[source]
        cause: Box<GardenError>,
    },
}

impl GardenError {
    /// Wraps an error with the reconciler stage it happened in. Already wrapped
    /// errors keep their original stage.
    pub fn at(stage: Stage) -> impl FnOnce(GardenError) -> GardenError {
        move |cause| match cause {
            GardenError::Failed { .. } => cause,
            cause => GardenError::Failed {
                stage,
                cause: Box::new(cause),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GardenError::State(_) => true,
            GardenError::Failed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Resolving => "resolving",
            Stage::Allocating => "allocating",
            Stage::Rendering => "rendering",
            Stage::Uploading => "uploading",
            Stage::Registering => "registering",
            Stage::Activating => "activating",
            Stage::Done => "done",
        };
        f.write_str(label)
    }
}
