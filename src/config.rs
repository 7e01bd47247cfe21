use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Error};
use config::{Config, Environment, File, FileFormat};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{
    error::ConfigError, model::AppLayer, ports::DEFAULT_PORT_FLOOR, remote::DEFAULT_APP_ROOT,
    server,
};

/// Overrides the location of the global config file.
pub const CONFIG_ENV: &str = "APPGARDEN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_server: Option<String>,
    pub lock_timeout_secs: u64,
    pub port_floor: u16,
    /// Read separately with `toml`, see [`load_config`].
    #[serde(skip_deserializing, skip_serializing_if = "is_empty_layer")]
    pub defaults: AppLayer,
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_server: None,
            lock_timeout_secs: 60,
            port_floor: DEFAULT_PORT_FLOOR,
            defaults: AppLayer::default(),
            servers: BTreeMap::new(),
        }
    }
}

fn is_empty_layer(layer: &AppLayer) -> bool {
    *layer == AppLayer::default()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcloud_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcloud_context: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_root: Option<String>,
    #[serde(default, skip_serializing_if = "InitConfig::is_empty")]
    pub init: InitConfig,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InitConfig {
    #[serde(default)]
    pub skip: BTreeSet<String>,
}

impl InitConfig {
    fn is_empty(&self) -> bool {
        self.skip.is_empty()
    }
}

impl ServerConfig {
    pub fn app_root(&self) -> &str {
        self.app_root.as_deref().unwrap_or(DEFAULT_APP_ROOT)
    }

    /// A server is addressed either by `host` or by a Hetzner Cloud server
    /// name and context.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |detail: String| ConfigError::InvalidServer {
            name: name.to_string(),
            detail,
        };
        match (&self.host, &self.hcloud_name, &self.hcloud_context) {
            (Some(_), None, None) | (None, Some(_), Some(_)) => {}
            (Some(_), _, _) => return Err(invalid("set either host or hcloud_name, not both".into())),
            (None, Some(_), None) => return Err(invalid("hcloud_name requires hcloud_context".into())),
            (None, None, _) => return Err(invalid("set host, or hcloud_name and hcloud_context".into())),
        }
        if self.domain.trim().is_empty() {
            return Err(invalid("domain must not be empty".into()));
        }
        server::check_skips(&self.init.skip).map_err(invalid)
    }
}

impl AppConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// The named server, else the default one.
    pub fn server(&self, name: Option<&str>) -> Result<(String, &ServerConfig), ConfigError> {
        let name = name
            .map(str::to_string)
            .or_else(|| self.default_server.clone())
            .ok_or(ConfigError::NoServer)?;
        let server = self
            .servers
            .get(&name)
            .ok_or_else(|| ConfigError::UnknownServer(name.clone()))?;
        Ok((name, server))
    }
}

pub fn config_path() -> Result<PathBuf, Error> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let dirs = BaseDirs::new().ok_or_else(|| anyhow!("Can't locate the home directory"))?;
    Ok(dirs.home_dir().join(".config").join("appgarden").join("config.toml"))
}

/// Loads the global config. A missing file gives the defaults.
pub fn load_config(path: &Path) -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix("APPGARDEN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Can't load configuration")?;

    let mut app_config: AppConfig = config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")?;
    // `config` folds key case: env variable names under [defaults] and server
    // names must keep theirs, so both are taken from the file itself.
    let document = read_document(path)?;
    app_config.defaults = read_defaults(&document, path)?;
    app_config.servers = restore_server_names(app_config.servers, &document);
    for (name, server) in &app_config.servers {
        server.validate(name)?;
    }
    Ok(app_config)
}

fn read_document(path: &Path) -> Result<toml::Table, Error> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(toml::Table::new()),
        Err(e) => return Err(e).with_context(|| format!("Can't read {}", path.display())),
    };
    text.parse()
        .with_context(|| format!("Can't parse {}", path.display()))
}

fn read_defaults(document: &toml::Table, path: &Path) -> Result<AppLayer, Error> {
    match document.get("defaults") {
        None => Ok(AppLayer::default()),
        Some(toml::Value::Table(table)) => Ok(AppLayer::from_table("global", table.clone())?),
        Some(other) => Err(anyhow!(
            "[defaults] in {} must be a table, found {}",
            path.display(),
            other.type_str()
        )),
    }
}

/// Renames servers back to their spelling in the file. Servers only known
/// from the environment keep the folded name.
fn restore_server_names(
    folded: BTreeMap<String, ServerConfig>,
    document: &toml::Table,
) -> BTreeMap<String, ServerConfig> {
    let written: Vec<&String> = match document.get("servers") {
        Some(toml::Value::Table(servers)) => servers.keys().collect(),
        _ => Vec::new(),
    };
    folded
        .into_iter()
        .map(|(key, server)| {
            let name = written
                .iter()
                .find(|name| name.to_lowercase() == key)
                .map(|name| name.to_string())
                .unwrap_or(key);
            (name, server)
        })
        .collect()
}

/// Writes the config back, readable by the owner only.
pub fn save_config(path: &Path, app_config: &AppConfig) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Can't create {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(app_config).context("Can't serialize configuration")?;
    fs::write(path, text).with_context(|| format!("Can't write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Can't restrict permissions of {}", path.display()))?;
    }
    Ok(())
}
