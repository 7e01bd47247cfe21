//! `{scope.field}` placeholder substitution for configuration strings.

use std::sync::LazyLock;

use regex::Regex;

use super::error::ConfigError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("placeholder pattern is valid")
});

/// Values visible to placeholders. `env` only exists when resolving through a
/// named environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scopes {
    pub app_name: String,
    pub app_slug: String,
    pub env_name: Option<String>,
}

impl Scopes {
    fn lookup(&self, scope: &str, field: &str) -> Option<&str> {
        match (scope, field) {
            ("app", "name") => Some(&self.app_name),
            ("app", "slug") => Some(&self.app_slug),
            ("env", "name") => self.env_name.as_deref(),
            _ => None,
        }
    }
}

/// Replaces every placeholder in one pass. Substituted values are never
/// rescanned, and braces that do not form a `{scope.field}` token are kept.
pub fn interpolate(template: &str, scopes: &Scopes) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(token), Some(scope), Some(field)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let value = scopes
            .lookup(scope.as_str(), field.as_str())
            .ok_or_else(|| {
                ConfigError::UnknownPlaceholder(format!("{}.{}", scope.as_str(), field.as_str()))
            })?;
        output.push_str(&template[last..token.start()]);
        output.push_str(value);
        last = token.end();
    }
    output.push_str(&template[last..]);
    Ok(output)
}

pub fn interpolate_opt(
    value: Option<String>,
    scopes: &Scopes,
) -> Result<Option<String>, ConfigError> {
    value.map(|value| interpolate(&value, scopes)).transpose()
}
