use std::path::Path;

use map_macro::hash_map;

use super::{error::GardenError, port::TemplateRenderer};

/// A language toolchain the `auto` method knows how to containerize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Runtime {
    pub name: &'static str,
    /// File whose presence at the source root selects this runtime.
    pub marker: &'static str,
    pub base_image: &'static str,
    pub setup_cmd: &'static str,
    /// Copied before the rest of the source so the dependency layer caches.
    pub copy_first: Option<&'static str>,
}

/// Checked in order; the first marker found wins.
pub const RUNTIMES: &[Runtime] = &[
    Runtime {
        name: "nodejs",
        marker: "package.json",
        base_image: "node:22",
        setup_cmd: "npm install",
        copy_first: Some("package*.json"),
    },
    Runtime {
        name: "python-pip",
        marker: "requirements.txt",
        base_image: "python:3.12",
        setup_cmd: "pip install -r requirements.txt",
        copy_first: Some("requirements.txt"),
    },
    Runtime {
        name: "python",
        marker: "pyproject.toml",
        base_image: "python:3.12",
        setup_cmd: "pip install .",
        copy_first: None,
    },
    Runtime {
        name: "ruby",
        marker: "Gemfile",
        base_image: "ruby:3.3",
        setup_cmd: "bundle install",
        copy_first: Some("Gemfile*"),
    },
    Runtime {
        name: "go",
        marker: "go.mod",
        base_image: "golang:1.23",
        setup_cmd: "go build -o /app/server .",
        copy_first: None,
    },
    Runtime {
        name: "rust",
        marker: "Cargo.toml",
        base_image: "rust:1.83",
        setup_cmd: "cargo build --release",
        copy_first: None,
    },
];

pub fn detect_local(source: &Path) -> Option<Runtime> {
    RUNTIMES
        .iter()
        .find(|runtime| source.join(runtime.marker).is_file())
        .copied()
}

pub fn dockerfile(
    runtime: &Runtime,
    container_port: u16,
    cmd: &str,
    setup_cmd: Option<&str>,
    renderer: &dyn TemplateRenderer,
) -> Result<String, GardenError> {
    renderer.render(
        "docker/Dockerfile",
        &hash_map! {
            "base_image" => runtime.base_image.to_string(),
            "copy_first" => runtime.copy_first.unwrap_or_default().to_string(),
            "setup_cmd" => setup_cmd.unwrap_or(runtime.setup_cmd).to_string(),
            "container_port" => container_port.to_string(),
            "cmd" => cmd.to_string(),
        },
    )
}
