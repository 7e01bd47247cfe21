use std::collections::HashMap;

use askama::Template;

use crate::domain::{error::GardenError, port::TemplateRenderer};

#[derive(Template)]
#[template(
    source = "# Managed by appgarden, regenerated from garden.json on every change.\n{{ host }} {\n{{ body }}}\n",
    ext = "txt"
)]
struct CaddySite {
    host: String,
    body: String,
}

#[derive(Template)]
#[template(
    source = "redir /{{ path }} /{{ path }}/ 308\nhandle_path /{{ path }}/* {\n{{ body }}}\n",
    ext = "txt"
)]
struct CaddyHandlePath {
    path: String,
    body: String,
}

#[derive(Template)]
#[template(source = "handle {\n{{ body }}}\n", ext = "txt")]
struct CaddyHandle {
    body: String,
}

#[derive(Template)]
#[template(source = "reverse_proxy localhost:{{ port }}\n", ext = "txt")]
struct CaddyReverseProxy {
    port: String,
}

#[derive(Template)]
#[template(source = "root * {{ root }}\nfile_server\n", ext = "txt")]
struct CaddyFileServer {
    root: String,
}

#[derive(Template)]
#[template(
    source = "# Managed by appgarden.\nimport {{ apps_dir }}/*.caddy\nimport {{ tunnels_dir }}/*.caddy\n",
    ext = "txt"
)]
struct CaddyRoot {
    apps_dir: String,
    tunnels_dir: String,
}

#[derive(Template)]
#[template(
    source = r#"[Unit]
Description=appgarden app {{ name }}
After=network.target{% if !requires.is_empty() %} {{ requires }}
Requires={{ requires }}{% endif %}

[Service]
Type=simple
WorkingDirectory={{ workdir }}
EnvironmentFile={{ env_file }}
ExecStart={{ exec_start }}
{% if !exec_stop.is_empty() %}ExecStop={{ exec_stop }}
{% endif %}Restart=always
RestartSec=3

[Install]
WantedBy=multi-user.target
"#,
    ext = "txt"
)]
struct SystemdUnit {
    name: String,
    workdir: String,
    env_file: String,
    exec_start: String,
    exec_stop: String,
    requires: String,
}

#[derive(Template)]
#[template(
    source = r#"services:
  app:
    image: {{ image }}
    container_name: {{ container_name }}
    restart: unless-stopped
    env_file: {{ env_file }}
    ports:
      - "127.0.0.1:{{ port }}:{{ container_port }}"
{% if !volumes.is_empty() %}    volumes:
{% for volume in volumes %}      - "{{ volume }}"
{% endfor %}{% endif %}"#,
    ext = "txt"
)]
struct DockerCompose {
    image: String,
    container_name: String,
    env_file: String,
    port: String,
    container_port: String,
    volumes: Vec<String>,
}

#[derive(Template)]
#[template(
    source = r#"FROM {{ base_image }}
WORKDIR /app
{% if !copy_first.is_empty() %}COPY {{ copy_first }} ./
RUN {{ setup_cmd }}
COPY . .
{% else %}COPY . .
RUN {{ setup_cmd }}
{% endif %}EXPOSE {{ container_port }}
CMD ["sh", "-c", {{ cmd }}]
"#,
    ext = "txt"
)]
struct Dockerfile {
    base_image: String,
    copy_first: String,
    setup_cmd: String,
    container_port: String,
    /// JSON-encoded, quotes included.
    cmd: String,
}

/// Renders the built-in templates by name.
#[derive(Clone, Copy, Debug, Default)]
pub struct AskamaRenderer;

struct Vars<'a> {
    template: &'a str,
    vars: &'a HashMap<&'a str, String>,
}

impl Vars<'_> {
    fn get(&self, key: &str) -> Result<String, GardenError> {
        self.vars.get(key).cloned().ok_or_else(|| GardenError::Render {
            template: self.template.to_string(),
            detail: format!("missing variable `{key}`"),
        })
    }

    fn optional(&self, key: &str) -> String {
        self.vars.get(key).cloned().unwrap_or_default()
    }
}

impl TemplateRenderer for AskamaRenderer {
    fn render(&self, name: &str, vars: &HashMap<&str, String>) -> Result<String, GardenError> {
        let v = Vars {
            template: name,
            vars,
        };
        let rendered = match name {
            "caddy/site" => CaddySite {
                host: v.get("host")?,
                body: v.get("body")?,
            }
            .render(),
            "caddy/handle_path" => CaddyHandlePath {
                path: v.get("path")?,
                body: v.get("body")?,
            }
            .render(),
            "caddy/handle" => CaddyHandle { body: v.get("body")? }.render(),
            "caddy/reverse_proxy" => CaddyReverseProxy { port: v.get("port")? }.render(),
            "caddy/file_server" => CaddyFileServer { root: v.get("root")? }.render(),
            "caddy/root" => CaddyRoot {
                apps_dir: v.get("apps_dir")?,
                tunnels_dir: v.get("tunnels_dir")?,
            }
            .render(),
            "systemd/unit" => SystemdUnit {
                name: v.get("name")?,
                workdir: v.get("workdir")?,
                env_file: v.get("env_file")?,
                exec_start: v.get("exec_start")?,
                exec_stop: v.optional("exec_stop"),
                requires: v.optional("requires"),
            }
            .render(),
            "docker/compose" => DockerCompose {
                image: v.get("image")?,
                container_name: v.get("container_name")?,
                env_file: v.get("env_file")?,
                port: v.get("port")?,
                container_port: v.get("container_port")?,
                volumes: v
                    .optional("volumes")
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            }
            .render(),
            "docker/Dockerfile" => Dockerfile {
                base_image: v.get("base_image")?,
                copy_first: v.optional("copy_first"),
                setup_cmd: v.get("setup_cmd")?,
                container_port: v.get("container_port")?,
                cmd: serde_json::Value::String(v.get("cmd")?).to_string(),
            }
            .render(),
            other => {
                return Err(GardenError::Render {
                    template: other.to_string(),
                    detail: "no such template".to_string(),
                })
            }
        };
        rendered
            .map(|text| format!("{}\n", text.trim_end_matches('\n')))
            .map_err(|e| GardenError::Render {
                template: name.to_string(),
                detail: e.to_string(),
            })
    }
}
