use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::error::{ConfigError, StateError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    Static,
    Command,
    Dockerfile,
    DockerCompose,
    Auto,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Static => "static",
            Method::Command => "command",
            Method::Dockerfile => "dockerfile",
            Method::DockerCompose => "docker-compose",
            Method::Auto => "auto",
        }
    }

    /// Static sites are served by the proxy directly and have no service or port.
    pub fn runs_service(self) -> bool {
        self != Method::Static
    }

    /// Methods whose service is an image built on the server.
    pub fn builds_image(self) -> bool {
        matches!(self, Method::Dockerfile | Method::Auto)
    }

    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Method::Static => &["source"],
            Method::Command => &["cmd"],
            Method::Dockerfile => &["source", "container_port"],
            Method::DockerCompose => &["source"],
            Method::Auto => &["cmd", "container_port"],
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "static" => Ok(Method::Static),
            "command" => Ok(Method::Command),
            "dockerfile" => Ok(Method::Dockerfile),
            "docker-compose" => Ok(Method::DockerCompose),
            "auto" => Ok(Method::Auto),
            other => Err(ConfigError::UnknownMethod(other.to_string())),
        }
    }
}

/// One layer of the configuration cascade. `None`, an empty map and an empty
/// list all mean "this layer does not set the field".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gitignore: Option<bool>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub meta: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FieldKind {
    Text,
    Port,
    Flag,
    Method,
    Dict,
    List,
}

impl FieldKind {
    fn of(key: &str) -> Option<FieldKind> {
        match key {
            "name" | "slug" | "server" | "source" | "branch" | "url" | "subdomain" | "path"
            | "domain" | "cmd" | "setup_cmd" | "env_file" => Some(FieldKind::Text),
            "port" | "container_port" => Some(FieldKind::Port),
            "gitignore" => Some(FieldKind::Flag),
            "method" => Some(FieldKind::Method),
            "env" | "meta" => Some(FieldKind::Dict),
            "exclude" | "volumes" => Some(FieldKind::List),
            _ => None,
        }
    }

    fn check(self, value: &toml::Value) -> Result<(), String> {
        use toml::Value;
        match (self, value) {
            (FieldKind::Text, Value::String(_)) => Ok(()),
            (FieldKind::Flag, Value::Boolean(_)) => Ok(()),
            (FieldKind::Port, Value::Integer(port)) if u16::try_from(*port).is_ok() => Ok(()),
            (FieldKind::Port, Value::Integer(port)) => Err(format!("{port} is not a valid port")),
            (FieldKind::Method, Value::String(method)) => {
                method.parse::<Method>().map(|_| ()).map_err(|e| e.to_string())
            }
            (FieldKind::Dict, Value::Table(table)) => {
                match table.iter().find(|(_, value)| !value.is_str()) {
                    Some((key, value)) => Err(format!(
                        "entry `{key}` must be a string, found {}",
                        value.type_str()
                    )),
                    None => Ok(()),
                }
            }
            (FieldKind::List, Value::Array(items)) => {
                match items.iter().find(|item| !item.is_str()) {
                    Some(item) => Err(format!("items must be strings, found {}", item.type_str())),
                    None => Ok(()),
                }
            }
            (kind, value) => Err(format!(
                "must be {}, found {}",
                kind.expected(),
                value.type_str()
            )),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            FieldKind::Text | FieldKind::Method => "a string",
            FieldKind::Port => "an integer",
            FieldKind::Flag => "a boolean",
            FieldKind::Dict => "a table of strings",
            FieldKind::List => "an array of strings",
        }
    }
}

impl AppLayer {
    /// Builds a layer from a raw TOML table, rejecting any value whose type
    /// does not match its field. Unknown keys are reported and ignored.
    pub fn from_table(layer: &str, table: toml::Table) -> Result<Self, ConfigError> {
        for (key, value) in &table {
            match FieldKind::of(key) {
                Some(kind) => kind.check(value).map_err(|detail| ConfigError::TypeMismatch {
                    layer: layer.to_string(),
                    field: key.clone(),
                    detail,
                })?,
                None => log::warn!("{layer} layer: ignoring unknown key `{key}`"),
            }
        }
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::TypeMismatch {
                layer: layer.to_string(),
                field: "*".to_string(),
                detail: e.message().to_string(),
            })
    }

    pub fn routing_fields(&self) -> Vec<&'static str> {
        [
            ("url", &self.url),
            ("subdomain", &self.subdomain),
            ("path", &self.path),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_some_and(|value| !value.is_empty()))
        .map(|(field, _)| field)
        .collect()
    }
}

/// Where an app is reachable: a host and, for subdirectory apps, a path
/// prefix stored without leading or trailing slashes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub host: String,
    pub path: Option<String>,
}

impl Route {
    /// Parses `host`, `host/path`, optionally with an http(s) scheme and a
    /// trailing slash.
    pub fn parse(url: &str) -> Result<Route, ConfigError> {
        let trimmed = url.trim();
        let without_scheme = ["https://", "http://"]
            .iter()
            .find_map(|scheme| trimmed.strip_prefix(scheme))
            .unwrap_or(trimmed)
            .trim_end_matches('/');
        let (host, path) = match without_scheme.split_once('/') {
            Some((host, path)) => (host, Some(path.trim_matches('/').to_string())),
            None => (without_scheme, None),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }
        Ok(Route {
            host: host.to_ascii_lowercase(),
            path: path.filter(|path| !path.is_empty()),
        })
    }

    pub fn url(&self) -> String {
        match &self.path {
            Some(path) => format!("{}/{}", self.host, path),
            None => self.host.clone(),
        }
    }

    pub fn kind(&self) -> RoutingKind {
        if self.path.is_some() {
            RoutingKind::Subdirectory
        } else {
            RoutingKind::Subdomain
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKind {
    Subdomain,
    Subdirectory,
}

/// The single concrete configuration produced for one deploy invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedDeployment {
    pub name: String,
    pub slug: String,
    pub environment: Option<String>,
    pub server: Option<String>,
    pub method: Method,
    pub source: Option<String>,
    pub branch: Option<String>,
    pub url: String,
    #[serde(skip)]
    pub route: Route,
    pub port: Option<u16>,
    pub container_port: Option<u16>,
    pub cmd: Option<String>,
    pub setup_cmd: Option<String>,
    pub env_file: Option<String>,
    pub gitignore: bool,
    #[serde(skip)]
    pub env: IndexMap<String, String>,
    pub meta: IndexMap<String, String>,
    pub exclude: Vec<String>,
    pub volumes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Git,
}

pub fn is_git_url(source: &str) -> bool {
    ["https://", "http://", "git@", "git://"]
        .iter()
        .any(|prefix| source.starts_with(prefix))
        || source.ends_with(".git")
}

/// Persisted, as-deployed form of an app inside `garden.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub method: Method,
    pub url: String,
    pub port: Option<u16>,
    pub source_type: Option<SourceType>,
    pub source: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systemd_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitignore: Option<bool>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub meta: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// Keys written by other versions are carried through rewrites untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Activation {
    Activated,
    /// Registered, but the last activation after a (re)deploy did not succeed.
    Pending,
}

impl AppRecord {
    pub fn route(&self) -> Result<Route, StateError> {
        Route::parse(&self.url).map_err(|e| StateError::CorruptDocument {
            path: format!("garden.json apps.{}", self.name),
            detail: e.to_string(),
        })
    }

    pub fn activation(&self) -> Activation {
        match self.activated_at {
            Some(activated_at) if activated_at >= self.updated_at => Activation::Activated,
            _ => Activation::Pending,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GardenRegistry {
    #[serde(default)]
    pub apps: BTreeMap<String, AppRecord>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GardenRegistry {
    pub fn app(&self, name: &str) -> Result<&AppRecord, StateError> {
        self.apps
            .get(name)
            .ok_or_else(|| StateError::AppNotFound(name.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTable {
    /// One past the highest port ever recorded; 65536 once the top port is used.
    pub next_port: u32,
    #[serde(default)]
    pub allocated: BTreeMap<u16, String>,
}
