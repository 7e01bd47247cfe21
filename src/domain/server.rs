//! Server bootstrap and reachability checks.

use std::{collections::BTreeSet, time::Instant};

use log::{info, warn};
use map_macro::hash_map;
use serde::Serialize;

use super::{
    error::{ConfigError, GardenError, TransportError},
    model::PortTable,
    port::{RemoteTransport, TemplateRenderer},
    registry::{RegistryStore, STATE_MODE},
    remote::{argv, quote, sh},
};

struct InitStep {
    name: &'static str,
    summary: &'static str,
    /// Written before the script runs.
    file: Option<(&'static str, &'static str)>,
    script: &'static str,
}

const SSH_HARDENING: &str = "PasswordAuthentication no\nMaxAuthTries 3\nX11Forwarding no\n";

const STEPS: &[InitStep] = &[
    InitStep {
        name: "update",
        summary: "Upgrading system packages",
        file: None,
        script: "export DEBIAN_FRONTEND=noninteractive && apt-get update -y && apt-get upgrade -y",
    },
    InitStep {
        name: "docker",
        summary: "Installing Docker",
        file: None,
        script: "export DEBIAN_FRONTEND=noninteractive \
            && apt-get install -y ca-certificates curl gnupg \
            && install -m 0755 -d /etc/apt/keyrings \
            && curl -fsSL \"https://download.docker.com/linux/$(. /etc/os-release; echo $ID)/gpg\" -o /etc/apt/keyrings/docker.asc \
            && chmod a+r /etc/apt/keyrings/docker.asc \
            && echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.asc] https://download.docker.com/linux/$(. /etc/os-release; echo $ID) $(. /etc/os-release; echo $VERSION_CODENAME) stable\" > /etc/apt/sources.list.d/docker.list \
            && apt-get update -y \
            && apt-get install -y docker-ce docker-ce-cli containerd.io docker-compose-plugin",
    },
    InitStep {
        name: "caddy",
        summary: "Installing Caddy",
        file: None,
        script: "export DEBIAN_FRONTEND=noninteractive \
            && apt-get install -y debian-keyring debian-archive-keyring apt-transport-https curl gnupg \
            && curl -1sLf https://dl.cloudsmith.io/public/caddy/stable/gpg.key | gpg --dearmor --yes -o /usr/share/keyrings/caddy-stable-archive-keyring.gpg \
            && curl -1sLf https://dl.cloudsmith.io/public/caddy/stable/debian.deb.txt > /etc/apt/sources.list.d/caddy-stable.list \
            && apt-get update -y \
            && apt-get install -y caddy",
    },
    InitStep {
        name: "firewall",
        summary: "Configuring the firewall",
        file: None,
        script: "export DEBIAN_FRONTEND=noninteractive \
            && apt-get install -y ufw \
            && ufw default deny incoming \
            && ufw default allow outgoing \
            && ufw allow ssh \
            && ufw allow http \
            && ufw allow https \
            && ufw --force enable",
    },
    InitStep {
        name: "ssh-hardening",
        summary: "Hardening sshd",
        file: Some(("/etc/ssh/sshd_config.d/hardening.conf", SSH_HARDENING)),
        script: "systemctl reload ssh || systemctl reload sshd",
    },
    InitStep {
        name: "fail2ban",
        summary: "Installing fail2ban",
        file: None,
        script: "export DEBIAN_FRONTEND=noninteractive \
            && apt-get install -y fail2ban \
            && systemctl enable fail2ban \
            && systemctl start fail2ban",
    },
    InitStep {
        name: "unattended-upgrades",
        summary: "Enabling unattended upgrades",
        file: None,
        script: "export DEBIAN_FRONTEND=noninteractive \
            && apt-get install -y unattended-upgrades \
            && dpkg-reconfigure -f noninteractive unattended-upgrades",
    },
];

/// Names accepted in a server's `init.skip` list.
pub fn step_names() -> Vec<&'static str> {
    STEPS.iter().map(|step| step.name).collect()
}

/// Rejects skip entries that name no init step.
pub fn check_skips<'a>(skip: impl IntoIterator<Item = &'a String>) -> Result<(), String> {
    let known = step_names();
    let unknown: Vec<&str> = skip
        .into_iter()
        .map(String::as_str)
        .filter(|name| !known.contains(name))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "unknown init steps {} (known: {})",
            unknown.join(", "),
            known.join(", ")
        ))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub ran: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
    /// State documents created because they did not exist yet.
    pub created: Vec<String>,
}

/// Prepares a fresh server: packages, proxy, hardening, directory layout and
/// empty state documents. Existing state documents are left untouched, so
/// running it twice is harmless.
pub async fn init(
    store: &RegistryStore,
    renderer: &dyn TemplateRenderer,
    skip: &BTreeSet<String>,
) -> Result<InitReport, GardenError> {
    let transport = store.transport();
    let layout = store.layout();
    check_skips(skip).map_err(|detail| ConfigError::InvalidServer {
        name: transport.host().to_string(),
        detail,
    })?;

    let mut report = InitReport::default();
    for step in STEPS {
        if skip.contains(step.name) {
            info!("Skipping {}", step.name);
            report.skipped.push(step.name);
            continue;
        }
        info!("{}", step.summary);
        if let Some((path, contents)) = step.file {
            transport.write_file(path, contents.as_bytes(), STATE_MODE).await?;
        }
        transport.run(&sh(step.script)).await?;
        report.ran.push(step.name);
    }

    info!("Creating {}", layout.root());
    transport
        .run(&argv([
            "mkdir",
            "-p",
            &layout.apps_dir(),
            &layout.caddy_apps_dir(),
            &layout.caddy_tunnels_dir(),
            &format!("{}/tunnels", layout.root()),
        ]))
        .await?;
    let root = renderer.render(
        "caddy/root",
        &hash_map! {
            "apps_dir" => layout.caddy_apps_dir(),
            "tunnels_dir" => layout.caddy_tunnels_dir(),
        },
    )?;
    transport
        .write_file(&layout.caddyfile(), root.as_bytes(), STATE_MODE)
        .await?;
    let import = format!("import {}", layout.caddyfile());
    transport
        .run(&sh(format!(
            "mkdir -p /etc/caddy && touch /etc/caddy/Caddyfile && (grep -qxF {line} /etc/caddy/Caddyfile || echo {line} >> /etc/caddy/Caddyfile)",
            line = quote(&import)
        )))
        .await?;

    let empty_ports = serde_json::to_string_pretty(&PortTable::new(store.port_floor()))
        .map_err(|e| TransportError::Io(e.into()))?;
    for (path, contents) in [
        (layout.garden_json(), "{\n  \"apps\": {}\n}\n".to_string()),
        (layout.ports_json(), format!("{empty_ports}\n")),
    ] {
        match transport.read_file(&path).await {
            Ok(_) => info!("Keeping existing {path}"),
            Err(TransportError::NotFound(_)) => {
                transport.write_file(&path, contents.as_bytes(), STATE_MODE).await?;
                report.created.push(path);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !skip.contains("docker") {
        transport
            .run(&argv(["systemctl", "enable", "--now", "docker"]))
            .await?;
    }
    transport.run(&argv(["systemctl", "enable", "caddy"])).await?;
    if let Err(e) = transport.run(&argv(["systemctl", "restart", "caddy"])).await {
        warn!("Caddy did not restart: {e}");
    }
    info!("{} is ready", transport.host());
    Ok(report)
}

/// Round trip time of a trivial command.
pub async fn ping(transport: &dyn RemoteTransport) -> Result<std::time::Duration, GardenError> {
    let started = Instant::now();
    let output = transport.run(&argv(["echo", "ok"])).await?;
    if output.trim() != "ok" {
        return Err(TransportError::Connection {
            host: transport.host().to_string(),
            detail: format!("unexpected reply {:?}", output.trim()),
        }
        .into());
    }
    Ok(started.elapsed())
}
