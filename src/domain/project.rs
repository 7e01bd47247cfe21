//! `appgarden.toml`: an `[app]` table plus `[environments.<name>]` overrides.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use itertools::Itertools;

use super::{error::ConfigError, model::AppLayer};

pub const PROJECT_FILE: &str = "appgarden.toml";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: String,
    pub app: AppLayer,
    pub environments: BTreeMap<String, AppLayer>,
    /// Directory relative sources are resolved against.
    pub root: PathBuf,
}

impl ProjectConfig {
    pub fn parse(text: &str, root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut document: toml::Table =
            toml::from_str(text).map_err(|e| ConfigError::InvalidProject(e.message().to_string()))?;

        let app_table = match document.remove("app") {
            Some(toml::Value::Table(table)) => table,
            Some(other) => {
                return Err(ConfigError::TypeMismatch {
                    layer: "project".into(),
                    field: "app".into(),
                    detail: format!("must be a table, found {}", other.type_str()),
                })
            }
            None => toml::Table::new(),
        };
        let app = AppLayer::from_table("app", app_table)?;
        let name = app
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigError::InvalidProject("[app] must have a name".into()))?;

        let environments = match document.remove("environments") {
            Some(toml::Value::Table(table)) => table
                .into_iter()
                .map(|(env_name, value)| match value {
                    toml::Value::Table(table) => {
                        AppLayer::from_table(&format!("environment {env_name}"), table)
                            .map(|layer| (env_name, layer))
                    }
                    other => Err(ConfigError::TypeMismatch {
                        layer: "project".into(),
                        field: format!("environments.{env_name}"),
                        detail: format!("must be a table, found {}", other.type_str()),
                    }),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?,
            Some(other) => {
                return Err(ConfigError::TypeMismatch {
                    layer: "project".into(),
                    field: "environments".into(),
                    detail: format!("must be a table, found {}", other.type_str()),
                })
            }
            None => BTreeMap::new(),
        };

        Ok(ProjectConfig {
            name,
            app,
            environments,
            root: root.into(),
        })
    }

    /// Loads `path` directly when it is a file, otherwise `path/appgarden.toml`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = if path.is_file() {
            path.to_path_buf()
        } else {
            path.join(PROJECT_FILE)
        };
        if !file.exists() {
            return Err(ConfigError::ProjectNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(&file)
            .map_err(|e| ConfigError::InvalidProject(format!("{}: {e}", file.display())))?;
        let root = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, root)
    }

    pub fn environment(&self, name: &str) -> Result<&AppLayer, ConfigError> {
        self.environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: name.to_string(),
                available: match self.environments.keys().join(", ") {
                    names if names.is_empty() => "(none)".to_string(),
                    names => names,
                },
            })
    }

    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }
}
