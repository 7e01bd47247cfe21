//! Route fragments, regenerated whole from the registry on every change.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet},
};

use itertools::Itertools;
use map_macro::hash_map;
use split_iter::Splittable;

use super::{
    error::{GardenError, StateError},
    model::{GardenRegistry, Method, Route},
    port::TemplateRenderer,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Upstream {
    Proxy(u16),
    Files(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HostRoute {
    app: String,
    path: Option<String>,
    upstream: Upstream,
}

/// Every host that at least one registered app is routed at.
pub fn hosts(registry: &GardenRegistry) -> Result<BTreeSet<String>, StateError> {
    registry
        .apps
        .values()
        .map(|record| record.route().map(|route| route.host))
        .collect()
}

/// Fails when two apps claim the same host and path.
pub fn check_conflicts(registry: &GardenRegistry) -> Result<(), StateError> {
    let mut claimed: BTreeMap<Route, &str> = BTreeMap::new();
    for record in registry.apps.values() {
        let route = record.route()?;
        if let Some(owner) = claimed.get(&route) {
            return Err(StateError::RouteConflict {
                route: route.url(),
                owner: owner.to_string(),
            });
        }
        claimed.insert(route, &record.name);
    }
    Ok(())
}

fn routes_at(host: &str, registry: &GardenRegistry) -> Result<Vec<HostRoute>, StateError> {
    let mut routes = Vec::new();
    for record in registry.apps.values() {
        let route = record.route()?;
        if route.host != host {
            continue;
        }
        let corrupt = |detail: &str| StateError::CorruptDocument {
            path: format!("garden.json apps.{}", record.name),
            detail: detail.to_string(),
        };
        let upstream = match record.method {
            Method::Static => Upstream::Files(
                record
                    .source_path
                    .clone()
                    .ok_or_else(|| corrupt("static app without source_path"))?,
            ),
            _ => Upstream::Proxy(record.port.ok_or_else(|| corrupt("app without port"))?),
        };
        routes.push(HostRoute {
            app: record.name.clone(),
            path: route.path,
            upstream,
        });
    }
    Ok(routes)
}

/// Full text of the fragment for `host`, or `None` when no app is routed
/// there any more. Path routes come most specific first so a first-match
/// proxy never shadows `/api/v2` with `/api`; a root app sharing the host
/// becomes the trailing catch-all.
pub fn recompute(
    host: &str,
    registry: &GardenRegistry,
    renderer: &dyn TemplateRenderer,
) -> Result<Option<String>, GardenError> {
    let routes = routes_at(host, registry)?;
    let (path_routes, root_routes) = routes.into_iter().split(|route| route.path.is_none());
    let path_routes: Vec<HostRoute> = path_routes
        .sorted_by_key(|route| {
            let path = route.path.clone().unwrap_or_default();
            (Reverse(path.len()), path)
        })
        .collect();
    let root_routes: Vec<HostRoute> = root_routes.collect();

    for (first, second) in path_routes.iter().tuple_windows() {
        if first.path == second.path {
            return Err(StateError::RouteConflict {
                route: format!("{host}/{}", second.path.as_deref().unwrap_or_default()),
                owner: first.app.clone(),
            }
            .into());
        }
    }
    if let [first, _, ..] = root_routes.as_slice() {
        return Err(StateError::RouteConflict {
            route: host.to_string(),
            owner: first.app.clone(),
        }
        .into());
    }
    if path_routes.is_empty() && root_routes.is_empty() {
        return Ok(None);
    }

    let mut blocks = Vec::with_capacity(path_routes.len() + root_routes.len());
    for route in &path_routes {
        blocks.push(renderer.render(
            "caddy/handle_path",
            &hash_map! {
                "path" => route.path.clone().unwrap_or_default(),
                "body" => indent(&upstream(&route.upstream, renderer)?),
            },
        )?);
    }
    if let Some(root) = root_routes.first() {
        let body = upstream(&root.upstream, renderer)?;
        blocks.push(if path_routes.is_empty() {
            body
        } else {
            renderer.render("caddy/handle", &hash_map! { "body" => indent(&body) })?
        });
    }

    renderer
        .render(
            "caddy/site",
            &hash_map! {
                "host" => host.to_string(),
                "body" => indent(&blocks.concat()),
            },
        )
        .map(Some)
}

fn upstream(upstream: &Upstream, renderer: &dyn TemplateRenderer) -> Result<String, GardenError> {
    match upstream {
        Upstream::Proxy(port) => {
            renderer.render("caddy/reverse_proxy", &hash_map! { "port" => port.to_string() })
        }
        Upstream::Files(root) => {
            renderer.render("caddy/file_server", &hash_map! { "root" => root.clone() })
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                "\n".to_string()
            } else {
                format!("\t{line}\n")
            }
        })
        .collect()
}
