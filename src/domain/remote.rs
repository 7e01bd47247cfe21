//! Remote filesystem layout and shell helpers.

pub const DEFAULT_APP_ROOT: &str = "/srv/appgarden";

/// Bit-exact paths of every document and directory under the app root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        RemoteLayout::new(DEFAULT_APP_ROOT)
    }
}

impl RemoteLayout {
    pub fn new(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        RemoteLayout {
            root: if root.is_empty() { "/".to_string() } else { root.to_string() },
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn garden_json(&self) -> String {
        format!("{}/garden.json", self.root)
    }

    pub fn ports_json(&self) -> String {
        format!("{}/ports.json", self.root)
    }

    pub fn lock_dir(&self) -> String {
        format!("{}/.garden.lock", self.root)
    }

    pub fn caddyfile(&self) -> String {
        format!("{}/caddy/Caddyfile", self.root)
    }

    pub fn caddy_apps_dir(&self) -> String {
        format!("{}/caddy/apps", self.root)
    }

    pub fn caddy_tunnels_dir(&self) -> String {
        format!("{}/caddy/tunnels", self.root)
    }

    /// One fragment per host name.
    pub fn fragment(&self, host: &str) -> String {
        let file: String = host
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
                _ => '_',
            })
            .collect();
        format!("{}/{file}.caddy", self.caddy_apps_dir())
    }

    pub fn apps_dir(&self) -> String {
        format!("{}/apps", self.root)
    }

    pub fn app_dir(&self, name: &str) -> String {
        format!("{}/apps/{name}", self.root)
    }

    pub fn app_json(&self, name: &str) -> String {
        format!("{}/app.json", self.app_dir(name))
    }

    pub fn env_file(&self, name: &str) -> String {
        format!("{}/.env", self.app_dir(name))
    }

    pub fn source_dir(&self, name: &str) -> String {
        format!("{}/source", self.app_dir(name))
    }

    pub fn data_dir(&self, name: &str) -> String {
        format!("{}/data", self.app_dir(name))
    }

    pub fn compose_file(&self, name: &str) -> String {
        format!("{}/docker-compose.yml", self.app_dir(name))
    }

    pub fn unit_file(&self, name: &str) -> String {
        format!("{}/{}", self.app_dir(name), unit_name(name))
    }
}

pub fn unit_name(app: &str) -> String {
    format!("appgarden-{app}.service")
}

pub fn image_name(app: &str) -> String {
    format!("appgarden-{app}")
}

pub const SYSTEMD_DIR: &str = "/etc/systemd/system";

/// Single-quotes `value` for POSIX shells.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn sh(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

pub fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_rooted() {
        let layout = RemoteLayout::new("/opt/garden/");
        assert_eq!(layout.garden_json(), "/opt/garden/garden.json");
        assert_eq!(layout.ports_json(), "/opt/garden/ports.json");
        assert_eq!(layout.env_file("blog"), "/opt/garden/apps/blog/.env");
        assert_eq!(
            layout.unit_file("blog"),
            "/opt/garden/apps/blog/appgarden-blog.service"
        );
    }

    #[test]
    fn fragment_names_are_sanitized() {
        let layout = RemoteLayout::default();
        assert_eq!(
            layout.fragment("apps.example.com"),
            "/srv/appgarden/caddy/apps/apps.example.com.caddy"
        );
        assert_eq!(
            layout.fragment("host:8080"),
            "/srv/appgarden/caddy/apps/host_8080.caddy"
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("/srv/appgarden/garden.json"), "/srv/appgarden/garden.json");
        assert_eq!(quote("it's here"), r"'it'\''s here'");
        assert_eq!(quote(""), "''");
    }
}
