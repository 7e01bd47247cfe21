//! Day-to-day operations on registered apps: listing, service control, logs
//! and registry repair.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use serde::Serialize;

use super::{
    error::{ConfigError, GardenError},
    interruptible, lock,
    model::{Activation, AppRecord},
    port::{RegistryLock, RemoteTransport},
    registry::{RegistryStore, Snapshot, Transaction, STATE_MODE},
    remote::{argv, sh},
    routing, ReconciliationService,
};

/// A registered app together with the state of its service.
#[derive(Clone, Debug, Serialize)]
pub struct AppStatus {
    #[serde(flatten)]
    pub record: AppRecord,
    /// `systemctl is-active` output, or `static` for apps without a service.
    pub service: String,
    pub activation: Activation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    fn verb(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

pub async fn list(store: &RegistryStore) -> Result<Vec<AppStatus>, GardenError> {
    let garden = store.garden().await?;
    let records: Vec<AppRecord> = garden.apps.into_values().collect();
    let units: Vec<&str> = records
        .iter()
        .filter_map(|record| record.systemd_unit.as_deref())
        .collect();
    let mut states = service_states(store.transport(), &units).await?;
    Ok(records
        .into_iter()
        .map(|record| {
            let service = record
                .systemd_unit
                .as_ref()
                .and_then(|unit| states.remove(unit))
                .unwrap_or_else(|| "static".to_string());
            AppStatus {
                activation: record.activation(),
                record,
                service,
            }
        })
        .collect())
}

pub async fn status(store: &RegistryStore, name: &str) -> Result<AppStatus, GardenError> {
    let record = store.garden().await?.app(name)?.clone();
    let service = match &record.systemd_unit {
        Some(unit) => service_states(store.transport(), &[unit.as_str()])
            .await?
            .remove(unit)
            .unwrap_or_else(|| "unknown".to_string()),
        None => "static".to_string(),
    };
    Ok(AppStatus {
        activation: record.activation(),
        record,
        service,
    })
}

/// `systemctl is-active` prints one line per unit and exits non-zero when any
/// of them is not active, so only the output is used.
async fn service_states(
    transport: &dyn RemoteTransport,
    units: &[&str],
) -> Result<BTreeMap<String, String>, GardenError> {
    if units.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut command = argv(["systemctl", "is-active"]);
    command.extend(units.iter().map(|unit| unit.to_string()));
    let output = transport.run_command(&command).await?;
    Ok(units
        .iter()
        .map(|unit| unit.to_string())
        .zip(output.stdout.lines().map(|line| line.trim().to_string()))
        .collect())
}

pub async fn control(
    store: &RegistryStore,
    name: &str,
    action: ServiceAction,
) -> Result<(), GardenError> {
    let unit = service_unit(store, name).await?;
    store
        .transport()
        .run(&argv(["systemctl", action.verb(), &unit]))
        .await?;
    info!("{name}: {}", action.verb());
    Ok(())
}

pub async fn logs(store: &RegistryStore, name: &str, lines: usize) -> Result<String, GardenError> {
    let unit = service_unit(store, name).await?;
    Ok(store
        .transport()
        .run(&argv([
            "journalctl",
            "-u",
            &unit,
            "--no-pager",
            "-n",
            &lines.to_string(),
        ]))
        .await?)
}

async fn service_unit(store: &RegistryStore, name: &str) -> Result<String, GardenError> {
    store
        .garden()
        .await?
        .app(name)?
        .systemd_unit
        .clone()
        .ok_or_else(|| ConfigError::NoService(name.to_string()).into())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub unlocked: bool,
    /// Port entries whose owner is no longer registered.
    pub dropped_ports: Vec<(u16, String)>,
    /// Ports of registered apps missing from the port table.
    pub restored_ports: Vec<(u16, String)>,
    pub fragments: Vec<String>,
    pub removed_fragments: Vec<String>,
}

/// Rebuilds everything derivable from `garden.json`: the port table, the
/// per-app mirrors and every proxy fragment.
pub async fn repair(
    service: &ReconciliationService,
    force_unlock: bool,
) -> Result<RepairReport, GardenError> {
    let store = &service.store;
    let transport = store.transport();
    let mut report = RepairReport::default();
    if force_unlock {
        warn!("Forcibly removing the registry lock");
        transport
            .run(&sh(lock::force_release_script(&store.layout().lock_dir())))
            .await?;
        report.unlocked = true;
    }

    let lock = store.lock().await?;
    let repaired = interruptible(rebuild(&lock, service, report)).await;
    store.unlock(lock).await;
    let report = repaired?;

    if let Err(e) = transport.run(&argv(["systemctl", "reload", "caddy"])).await {
        warn!("Could not reload caddy: {e}");
    }
    Ok(report)
}

async fn rebuild(
    lock: &RegistryLock,
    service: &ReconciliationService,
    mut report: RepairReport,
) -> Result<RepairReport, GardenError> {
    let store = &service.store;
    let layout = store.layout();
    let Snapshot { garden, mut ports } = store.snapshot(lock).await?;
    routing::check_conflicts(&garden)?;

    let (orphans, owned): (Vec<(u16, String)>, Vec<(u16, String)>) = ports
        .allocated
        .iter()
        .map(|(port, owner)| (*port, owner.clone()))
        .partition(|(port, owner)| {
            garden
                .apps
                .get(owner)
                .map_or(true, |record| record.port != Some(*port))
        });
    for (port, owner) in &orphans {
        warn!("Dropping port {port} held by `{owner}`");
        ports.allocated.remove(port);
    }
    report.dropped_ports = orphans;
    for record in garden.apps.values() {
        let Some(port) = record.port else { continue };
        if owned.iter().any(|(owned, _)| *owned == port) {
            continue;
        }
        match ports.register(port, &record.name) {
            Ok(()) => report.restored_ports.push((port, record.name.clone())),
            Err(e) => warn!("{}: {e}", record.name),
        }
    }

    let mut txn = Transaction::new();
    txn.put_json(&layout.ports_json(), &ports)?;
    for record in garden.apps.values() {
        txn.put_json(&layout.app_json(&record.name), record)?;
    }
    let hosts = routing::hosts(&garden)?;
    for host in &hosts {
        if let Some(text) = routing::recompute(host, &garden, service.renderer.as_ref())? {
            let path = layout.fragment(host);
            txn.put(&path, text, STATE_MODE);
            report.fragments.push(path);
        }
    }
    let expected: BTreeSet<String> = hosts.iter().map(|host| layout.fragment(host)).collect();
    let listing = store
        .transport()
        .run_command(&argv(["ls", "-1", &layout.caddy_apps_dir()]))
        .await?;
    for file in listing.stdout.lines().filter(|file| file.ends_with(".caddy")) {
        let path = format!("{}/{file}", layout.caddy_apps_dir());
        if !expected.contains(&path) {
            txn.delete(&path);
            report.removed_fragments.push(path);
        }
    }
    store.commit(lock, txn).await?;
    info!(
        "Repaired {} apps on {} hosts",
        garden.apps.len(),
        hosts.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        domain::{
            error::StateError, port::CommandOutput, ports::DEFAULT_PORT_FLOOR,
            model::Method, remote::RemoteLayout, routing::tests::record,
        },
        infra::{memory::MemoryTransport, templates::AskamaRenderer},
    };

    const LOCK: &str = "/srv/appgarden/.garden.lock";

    fn service(transport: &Arc<MemoryTransport>) -> ReconciliationService {
        ReconciliationService {
            store: RegistryStore::new(
                transport.clone(),
                RemoteLayout::default(),
                DEFAULT_PORT_FLOOR,
                Duration::from_millis(100),
            ),
            renderer: Box::new(AskamaRenderer),
        }
    }

    fn seed(transport: &MemoryTransport, records: &[AppRecord], ports: &str) {
        let apps: BTreeMap<&str, &AppRecord> = records
            .iter()
            .map(|record| (record.name.as_str(), record))
            .collect();
        transport.put(
            "/srv/appgarden/garden.json",
            &serde_json::json!({ "apps": apps }).to_string(),
        );
        transport.put("/srv/appgarden/ports.json", ports);
    }

    fn output(stdout: &str, code: i32) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            code,
        }
    }

    #[tokio::test]
    async fn list_reports_service_state() {
        let transport = Arc::new(MemoryTransport::new());
        let mut blog = record("blog", Method::Command, "blog.example.com", Some(10000));
        blog.systemd_unit = Some("appgarden-blog.service".into());
        let docs = record("docs", Method::Static, "example.com/docs", None);
        seed(&transport, &[blog, docs], r#"{"next_port": 10001, "allocated": {"10000": "blog"}}"#);
        transport.respond("systemctl is-active", output("failed\n", 3));

        let service = service(&transport);
        let statuses = list(&service.store).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].record.name, "blog");
        assert_eq!(statuses[0].service, "failed");
        assert_eq!(statuses[1].service, "static");
        assert!(transport
            .commands()
            .contains(&"systemctl is-active appgarden-blog.service".to_string()));
    }

    #[tokio::test]
    async fn static_apps_cannot_be_controlled() {
        let transport = Arc::new(MemoryTransport::new());
        let docs = record("docs", Method::Static, "example.com/docs", None);
        seed(&transport, &[docs], r#"{"next_port": 10000}"#);
        let service = service(&transport);
        let error = control(&service.store, "docs", ServiceAction::Restart)
            .await
            .unwrap_err();
        assert!(matches!(error, GardenError::Config(ConfigError::NoService(_))));
        let error = logs(&service.store, "ghost", 50).await.unwrap_err();
        assert!(matches!(error, GardenError::State(StateError::AppNotFound(_))));
    }

    #[tokio::test]
    async fn logs_come_from_the_journal() {
        let transport = Arc::new(MemoryTransport::new());
        let mut blog = record("blog", Method::Command, "blog.example.com", Some(10000));
        blog.systemd_unit = Some("appgarden-blog.service".into());
        seed(&transport, &[blog], r#"{"next_port": 10001, "allocated": {"10000": "blog"}}"#);
        transport.respond("journalctl", output("listening on 10000\n", 0));
        let service = service(&transport);
        let text = logs(&service.store, "blog", 20).await.unwrap();
        assert_eq!(text, "listening on 10000\n");
        assert!(transport
            .commands()
            .contains(&"journalctl -u appgarden-blog.service --no-pager -n 20".to_string()));
    }

    #[tokio::test]
    async fn repair_rebuilds_derived_state() {
        let transport = Arc::new(MemoryTransport::new());
        let blog = record("blog", Method::Command, "blog.example.com", Some(10000));
        let api = record("api", Method::Command, "example.com/api", Some(10001));
        seed(
            &transport,
            &[blog, api],
            r#"{"next_port": 10003, "allocated": {"10000": "blog", "10002": "gone"}}"#,
        );
        transport.put("/srv/appgarden/caddy/apps/old.example.com.caddy", "old {}\n");
        transport.respond(
            "ls -1 /srv/appgarden/caddy/apps",
            output("blog.example.com.caddy\nold.example.com.caddy\n", 0),
        );
        transport.hold_lock(LOCK, "crashed pid 9");

        let service = service(&transport);
        let report = repair(&service, true).await.unwrap();
        assert!(report.unlocked);
        assert_eq!(report.dropped_ports, vec![(10002, "gone".to_string())]);
        assert_eq!(report.restored_ports, vec![(10001, "api".to_string())]);
        assert_eq!(
            report.removed_fragments,
            vec!["/srv/appgarden/caddy/apps/old.example.com.caddy".to_string()]
        );

        let ports = transport.json("/srv/appgarden/ports.json");
        assert_eq!(ports["allocated"], serde_json::json!({"10000": "blog", "10001": "api"}));
        assert!(transport.exists("/srv/appgarden/caddy/apps/example.com.caddy"));
        assert!(transport.exists("/srv/appgarden/caddy/apps/blog.example.com.caddy"));
        assert!(transport.exists("/srv/appgarden/apps/api/app.json"));
        assert!(!transport.exists("/srv/appgarden/caddy/apps/old.example.com.caddy"));
        assert!(!transport.lock_held(LOCK));
    }

    #[tokio::test]
    async fn repair_waits_for_a_live_lock() {
        let transport = Arc::new(MemoryTransport::new());
        transport.hold_lock(LOCK, "alice pid 7");
        let service = service(&transport);
        let error = repair(&service, false).await.unwrap_err();
        assert!(error.is_retryable());
        assert!(transport.lock_held(LOCK));
    }
}
