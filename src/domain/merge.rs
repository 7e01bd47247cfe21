use indexmap::IndexMap;
use itertools::Itertools;

use super::model::AppLayer;

/// Layers `over` on top of `base`.
///
/// Scalars from `over` win when set. `env` and `meta` are merged key by key
/// with `over` winning, keeping `base` order and appending new keys. `exclude`
/// and `volumes` are concatenated and de-duplicated, first occurrence kept.
///
/// `url`, `subdomain` and `path` form one routing group: a layer that sets any
/// of them replaces the routing chosen by the layers below it.
pub fn merge(base: AppLayer, over: AppLayer) -> AppLayer {
    let (url, subdomain, path) = if over.routing_fields().is_empty() {
        (base.url, base.subdomain, base.path)
    } else {
        (over.url, over.subdomain, over.path)
    };
    AppLayer {
        name: over.name.or(base.name),
        slug: over.slug.or(base.slug),
        server: over.server.or(base.server),
        method: over.method.or(base.method),
        source: over.source.or(base.source),
        branch: over.branch.or(base.branch),
        url,
        subdomain,
        path,
        domain: over.domain.or(base.domain),
        port: over.port.or(base.port),
        container_port: over.container_port.or(base.container_port),
        cmd: over.cmd.or(base.cmd),
        setup_cmd: over.setup_cmd.or(base.setup_cmd),
        env_file: over.env_file.or(base.env_file),
        gitignore: over.gitignore.or(base.gitignore),
        env: merge_dict(base.env, over.env),
        meta: merge_dict(base.meta, over.meta),
        exclude: concat_unique(base.exclude, over.exclude),
        volumes: concat_unique(base.volumes, over.volumes),
    }
}

pub fn merge_all(layers: impl IntoIterator<Item = AppLayer>) -> AppLayer {
    layers.into_iter().fold(AppLayer::default(), merge)
}

fn merge_dict(
    mut base: IndexMap<String, String>,
    over: IndexMap<String, String>,
) -> IndexMap<String, String> {
    // IndexMap::insert keeps the position of an existing key.
    base.extend(over);
    base
}

fn concat_unique(base: Vec<String>, over: Vec<String>) -> Vec<String> {
    base.into_iter().chain(over).unique().collect()
}
