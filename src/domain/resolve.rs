//! Precedence cascade: builtin < global < app < environment < cli.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use super::{
    error::ConfigError,
    interpolate::{interpolate, interpolate_opt, Scopes},
    merge::merge_all,
    model::{AppLayer, ResolvedDeployment, Route},
};

pub const PRODUCTION: &str = "production";

/// App names end up in remote paths, systemd units and docker image names.
static APP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9][a-z0-9-]*$").expect("app name pattern is valid"));

pub fn check_app_name(name: &str) -> Result<(), ConfigError> {
    if APP_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidAppName(name.to_string()))
    }
}

/// The user-controlled layers, lowest precedence first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layers {
    pub global: AppLayer,
    pub app: AppLayer,
    pub environment: AppLayer,
    pub cli: AppLayer,
}

impl Layers {
    /// Server named by the highest layer that names one. Needed before
    /// resolution because the builtin layer carries that server's domain.
    pub fn selected_server(&self) -> Option<String> {
        [&self.cli, &self.environment, &self.app, &self.global]
            .into_iter()
            .find_map(|layer| layer.server.clone())
    }

    fn merged(&self, server_domain: Option<&str>) -> AppLayer {
        let builtin = AppLayer {
            gitignore: Some(true),
            domain: server_domain.map(str::to_string),
            ..Default::default()
        };
        merge_all([
            builtin,
            self.global.clone(),
            self.app.clone(),
            self.environment.clone(),
            self.cli.clone(),
        ])
    }
}

pub fn derive_app_name(base_name: &str, environment: &str) -> String {
    if environment == PRODUCTION {
        base_name.to_string()
    } else {
        format!("{base_name}-{environment}")
    }
}

/// Produces the concrete deployment for one invocation. `environment` is the
/// named environment when resolving through a project file.
pub fn resolve(
    layers: &Layers,
    environment: Option<&str>,
    server_domain: Option<&str>,
) -> Result<ResolvedDeployment, ConfigError> {
    let merged = layers.merged(server_domain);

    let base_name = merged
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or(ConfigError::MissingField("name"))?;
    let name = match environment {
        Some(environment) => derive_app_name(&base_name, environment),
        None => base_name.clone(),
    };
    check_app_name(&name)?;
    let scopes = Scopes {
        app_slug: merged.slug.clone().unwrap_or_else(|| base_name.clone()),
        app_name: name,
        env_name: environment.map(str::to_string),
    };
    let merged = interpolate_layer(merged, &scopes)?;

    let method = merged.method.ok_or(ConfigError::MissingField("method"))?;
    let route = route_of(&merged)?;
    for field in method.required_fields() {
        let present = match *field {
            "source" => merged.source.is_some(),
            "cmd" => merged.cmd.is_some(),
            "container_port" => merged.container_port.is_some(),
            _ => true,
        };
        if !present {
            return Err(ConfigError::MissingRequiredField {
                method: method.to_string(),
                field,
            });
        }
    }

    Ok(ResolvedDeployment {
        name: scopes.app_name,
        slug: scopes.app_slug,
        environment: environment.map(str::to_string),
        server: merged.server,
        method,
        source: merged.source,
        branch: merged.branch,
        url: route.url(),
        route,
        port: merged.port,
        container_port: merged.container_port,
        cmd: merged.cmd,
        setup_cmd: merged.setup_cmd,
        env_file: merged.env_file,
        gitignore: merged.gitignore.unwrap_or(true),
        env: merged.env,
        meta: merged.meta,
        exclude: merged.exclude,
        volumes: merged.volumes,
    })
}

fn route_of(layer: &AppLayer) -> Result<Route, ConfigError> {
    let set = layer.routing_fields();
    if set.len() > 1 {
        return Err(ConfigError::AmbiguousRouting(set.join(", ")));
    }
    let domain = || {
        layer
            .domain
            .as_deref()
            .filter(|domain| !domain.is_empty())
            .ok_or(ConfigError::MissingRequiredField {
                method: layer
                    .method
                    .map(|method| method.to_string())
                    .unwrap_or_default(),
                field: "domain",
            })
    };
    match set.first().copied() {
        Some("url") => Route::parse(layer.url.as_deref().unwrap_or_default()),
        Some("subdomain") => {
            let subdomain = layer.subdomain.as_deref().unwrap_or_default();
            Route::parse(&format!("{subdomain}.{}", domain()?))
        }
        Some("path") => {
            let path = layer.path.as_deref().unwrap_or_default().trim_matches('/');
            Route::parse(&format!("{}/{path}", domain()?))
        }
        _ => Err(ConfigError::MissingRouting),
    }
}

fn interpolate_layer(layer: AppLayer, scopes: &Scopes) -> Result<AppLayer, ConfigError> {
    let interpolate_map = |map: IndexMap<String, String>| {
        map.into_iter()
            .map(|(key, value)| Ok((key, interpolate(&value, scopes)?)))
            .collect::<Result<IndexMap<_, _>, ConfigError>>()
    };
    let interpolate_list = |list: Vec<String>| {
        list.iter()
            .map(|item| interpolate(item, scopes))
            .collect::<Result<Vec<_>, _>>()
    };
    Ok(AppLayer {
        name: layer.name,
        slug: layer.slug,
        server: interpolate_opt(layer.server, scopes)?,
        method: layer.method,
        source: interpolate_opt(layer.source, scopes)?,
        branch: interpolate_opt(layer.branch, scopes)?,
        url: interpolate_opt(layer.url, scopes)?,
        subdomain: interpolate_opt(layer.subdomain, scopes)?,
        path: interpolate_opt(layer.path, scopes)?,
        domain: interpolate_opt(layer.domain, scopes)?,
        port: layer.port,
        container_port: layer.container_port,
        cmd: interpolate_opt(layer.cmd, scopes)?,
        setup_cmd: interpolate_opt(layer.setup_cmd, scopes)?,
        env_file: interpolate_opt(layer.env_file, scopes)?,
        gitignore: layer.gitignore,
        env: interpolate_map(layer.env)?,
        meta: interpolate_map(layer.meta)?,
        exclude: interpolate_list(layer.exclude)?,
        volumes: interpolate_list(layer.volumes)?,
    })
}
