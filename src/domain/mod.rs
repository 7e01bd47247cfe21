use std::{
    collections::BTreeSet,
    fs,
    future::Future,
    path::{Path, PathBuf},
};

use chrono::Utc;
use log::{debug, error, info, warn};
use map_macro::hash_map;
use serde::Serialize;

use error::{ConfigError, GardenError, StateError, TransportError};
use model::{is_git_url, AppRecord, Method, ResolvedDeployment, SourceType};
use port::{RegistryLock, RemoteTransport, TemplateRenderer};
use registry::{RegistryStore, Snapshot, Transaction, SECRET_MODE, STATE_MODE};
use remote::{argv, image_name, quote, sh, unit_name, RemoteLayout, SYSTEMD_DIR};
use resolve::{check_app_name, resolve, Layers};
use runtime::Runtime;

pub mod apps;
pub mod error;
pub mod interpolate;
pub mod lock;
pub mod merge;
pub mod model;
pub mod port;
pub mod ports;
pub mod project;
pub mod registry;
pub mod remote;
pub mod resolve;
pub mod routing;
pub mod runtime;
pub mod server;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Allocating,
    Rendering,
    Uploading,
    Registering,
    Activating,
    Done,
}

pub struct ReconciliationService {
    pub store: RegistryStore,
    pub renderer: Box<dyn TemplateRenderer>,
}

pub struct DeployRequest {
    pub layers: Layers,
    pub environment: Option<String>,
    /// Base domain of the target server, the builtin `domain` default.
    pub server_domain: Option<String>,
    /// Relative local sources and env files are resolved against it.
    pub project_root: PathBuf,
    pub dry_run: bool,
}

pub enum Event {
    Deploy(DeployRequest),
    Redeploy(String),
    Remove { name: String, keep_data: bool },
}

#[derive(Debug)]
pub enum Outcome {
    Deployed {
        name: String,
        url: String,
        port: Option<u16>,
    },
    Planned(Plan),
    Redeployed {
        name: String,
    },
    /// Registered, but the service or proxy could not be (re)started.
    PartialActivation {
        name: String,
        cause: GardenError,
    },
    Removed {
        name: String,
    },
}

/// What a deploy would do, reported by `deploy --dry-run`.
#[derive(Clone, Debug, Serialize)]
pub struct Plan {
    pub deployment: ResolvedDeployment,
    pub port: Option<u16>,
    pub runtime: Option<&'static str>,
    pub uploads: Vec<String>,
    pub registry: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reservation {
    None,
    Allocated(u16),
    Registered(u16),
}

impl Reservation {
    fn port(self) -> Option<u16> {
        match self {
            Reservation::None => None,
            Reservation::Allocated(port) | Reservation::Registered(port) => Some(port),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Source {
    None,
    Local(PathBuf),
    Git { url: String, branch: Option<String> },
}

struct Artifacts {
    runtime: Option<Runtime>,
    dockerfile: Option<String>,
    compose: Option<String>,
    unit: Option<String>,
    env: Option<String>,
}

pub async fn reconcile(event: Event, service: &ReconciliationService) -> Result<Outcome, GardenError> {
    match event {
        Event::Deploy(request) => deploy(request, service).await,
        Event::Redeploy(name) => redeploy(&name, service).await,
        Event::Remove { name, keep_data } => remove(&name, keep_data, service).await,
    }
}

async fn deploy(request: DeployRequest, service: &ReconciliationService) -> Result<Outcome, GardenError> {
    let (deployment, source) = resolve(
        &request.layers,
        request.environment.as_deref(),
        request.server_domain.as_deref(),
    )
    .and_then(|deployment| {
        let source = locate_source(&deployment, &request.project_root)?;
        Ok((deployment, source))
    })
    .map_err(|e| GardenError::at(Stage::Resolving)(e.into()))?;
    info!(
        "Deploying {} ({}) to {}",
        deployment.name, deployment.method, deployment.url
    );

    enter(&deployment.name, Stage::Allocating);
    let reservation = reserve(&deployment, service)
        .await
        .map_err(GardenError::at(Stage::Allocating))?;

    enter(&deployment.name, Stage::Rendering);
    let artifacts = render(&deployment, &source, reservation, &request.project_root, service)
        .map_err(GardenError::at(Stage::Rendering))?;

    if request.dry_run {
        return Ok(Outcome::Planned(plan(
            deployment,
            &source,
            reservation,
            &artifacts,
            service.store.layout(),
        )));
    }

    enter(&deployment.name, Stage::Uploading);
    let runtime = upload(&deployment, &source, artifacts, service)
        .await
        .map_err(GardenError::at(Stage::Uploading))?;

    enter(&deployment.name, Stage::Registering);
    let lock = service
        .store
        .lock()
        .await
        .map_err(GardenError::at(Stage::Registering))?;
    let registered = interruptible(register(
        &lock,
        &deployment,
        &source,
        reservation,
        runtime,
        service,
    ))
    .await;
    service.store.unlock(lock).await;
    let record = registered.map_err(GardenError::at(Stage::Registering))?;

    enter(&record.name, Stage::Activating);
    Ok(match activate(&record, false, service).await {
        Ok(()) => {
            enter(&record.name, Stage::Done);
            info!("{} is live at {}", record.name, record.url);
            Outcome::Deployed {
                name: record.name,
                url: record.url,
                port: record.port,
            }
        }
        Err(cause) => partial(record.name, cause),
    })
}

fn enter(name: &str, stage: Stage) {
    debug!("{name}: {stage}");
}

fn locate_source(deployment: &ResolvedDeployment, root: &Path) -> Result<Source, ConfigError> {
    match &deployment.source {
        None => Ok(Source::None),
        Some(source) if is_git_url(source) => Ok(Source::Git {
            url: source.clone(),
            branch: deployment.branch.clone(),
        }),
        Some(source) => {
            let path = root.join(source);
            if !path.is_dir() {
                return Err(ConfigError::SourceNotFound(path));
            }
            Ok(Source::Local(path.canonicalize().unwrap_or(path)))
        }
    }
}

/// Picks the port from a fresh read without writing anything. The choice is
/// validated again under the lock.
async fn reserve(
    deployment: &ResolvedDeployment,
    service: &ReconciliationService,
) -> Result<Reservation, GardenError> {
    let garden = service.store.garden().await?;
    for record in garden.apps.values().filter(|r| r.name != deployment.name) {
        if record.route()? == deployment.route {
            return Err(StateError::RouteConflict {
                route: deployment.url.clone(),
                owner: record.name.clone(),
            }
            .into());
        }
    }

    if !deployment.method.runs_service() {
        return Ok(Reservation::None);
    }
    let mut ports = service.store.ports().await?;
    let reservation = match deployment.port {
        Some(port) => match ports.allocated.get(&port) {
            Some(owner) if *owner != deployment.name => {
                return Err(StateError::PortAlreadyOwned {
                    port,
                    owner: owner.clone(),
                }
                .into())
            }
            _ => Reservation::Registered(port),
        },
        None => {
            let listening = match ports.port_of(&deployment.name) {
                Some(_) => BTreeSet::new(),
                None => ports::listening_ports(service.store.transport()).await?,
            };
            let port = ports.allocate(
                &deployment.name,
                service.store.port_floor(),
                &listening,
            )?;
            Reservation::Allocated(port)
        }
    };
    debug!("Reserved {reservation:?} for {}", deployment.name);
    Ok(reservation)
}

fn render(
    deployment: &ResolvedDeployment,
    source: &Source,
    reservation: Reservation,
    project_root: &Path,
    service: &ReconciliationService,
) -> Result<Artifacts, GardenError> {
    let layout = service.store.layout();
    let renderer = service.renderer.as_ref();
    let name = &deployment.name;
    let method = deployment.method;

    let runtime = match (method, source) {
        (Method::Auto, Source::Local(path)) => Some(
            runtime::detect_local(path).ok_or_else(|| ConfigError::RuntimeNotDetected(name.clone()))?,
        ),
        _ => None,
    };
    let dockerfile = runtime
        .map(|runtime| dockerfile_for(deployment, &runtime, renderer))
        .transpose()?;

    let container_port = deployment
        .container_port
        .map(|port| port.to_string())
        .unwrap_or_default();
    let port = reservation
        .port()
        .map(|port| port.to_string())
        .unwrap_or_default();
    let compose = if method.builds_image() {
        Some(renderer.render(
            "docker/compose",
            &hash_map! {
                "image" => image_name(name),
                "container_name" => image_name(name),
                "env_file" => layout.env_file(name),
                "port" => port.clone(),
                "container_port" => container_port.clone(),
                "volumes" => deployment.volumes.join("\n"),
            },
        )?)
    } else {
        None
    };

    let unit = match service_command(method, deployment, source, layout) {
        Some((workdir, exec_start, exec_stop, requires)) => Some(renderer.render(
            "systemd/unit",
            &hash_map! {
                "name" => name.clone(),
                "workdir" => workdir,
                "env_file" => layout.env_file(name),
                "exec_start" => exec_start,
                "exec_stop" => exec_stop,
                "requires" => requires,
            },
        )?),
        None => None,
    };

    let env = if method.runs_service() {
        let port_value = if method.builds_image() { container_port } else { port };
        Some(env_contents(deployment, &port_value, project_root)?)
    } else {
        None
    };

    Ok(Artifacts {
        runtime,
        dockerfile,
        compose,
        unit,
        env,
    })
}

/// Working directory, start and stop commands and unit dependency of the
/// service running `deployment`, if it has one.
fn service_command(
    method: Method,
    deployment: &ResolvedDeployment,
    source: &Source,
    layout: &RemoteLayout,
) -> Option<(String, String, String, String)> {
    let name = &deployment.name;
    let workdir = match source {
        Source::None => layout.app_dir(name),
        _ => layout.source_dir(name),
    };
    match method {
        Method::Static => None,
        Method::Command => Some((
            workdir,
            format!("/bin/sh -c {}", quote(deployment.cmd.as_deref().unwrap_or_default())),
            String::new(),
            String::new(),
        )),
        Method::Dockerfile | Method::Auto => {
            let compose = format!(
                "/usr/bin/docker compose -p {} -f {}",
                image_name(name),
                layout.compose_file(name)
            );
            Some((
                layout.app_dir(name),
                format!("{compose} up"),
                format!("{compose} down"),
                "docker.service".to_string(),
            ))
        }
        Method::DockerCompose => {
            let compose = format!("/usr/bin/docker compose -p {}", image_name(name));
            Some((
                workdir,
                format!("{compose} up"),
                format!("{compose} down"),
                "docker.service".to_string(),
            ))
        }
    }
}

/// `.env` body: `PORT`, then the local env file, then the `env` table.
fn env_contents(
    deployment: &ResolvedDeployment,
    port: &str,
    project_root: &Path,
) -> Result<String, ConfigError> {
    let mut contents = String::new();
    if !port.is_empty() {
        contents.push_str(&format!("PORT={port}\n"));
    }
    if let Some(env_file) = &deployment.env_file {
        let path = project_root.join(env_file);
        let text = fs::read_to_string(&path).map_err(|e| {
            ConfigError::InvalidProject(format!("env_file {}: {e}", path.display()))
        })?;
        contents.push_str(text.trim_end());
        contents.push('\n');
    }
    for (key, value) in &deployment.env {
        contents.push_str(&format!("{key}={value}\n"));
    }
    Ok(contents)
}

fn dockerfile_for(
    deployment: &ResolvedDeployment,
    runtime: &Runtime,
    renderer: &dyn TemplateRenderer,
) -> Result<String, GardenError> {
    runtime::dockerfile(
        runtime,
        deployment.container_port.unwrap_or_default(),
        deployment.cmd.as_deref().unwrap_or_default(),
        deployment.setup_cmd.as_deref(),
        renderer,
    )
}

fn plan(
    deployment: ResolvedDeployment,
    source: &Source,
    reservation: Reservation,
    artifacts: &Artifacts,
    layout: &RemoteLayout,
) -> Plan {
    let name = &deployment.name;
    let mut uploads = Vec::new();
    match source {
        Source::Local(path) => uploads.push(format!("{} -> {}", path.display(), layout.source_dir(name))),
        Source::Git { url, .. } => uploads.push(format!("{url} -> {}", layout.source_dir(name))),
        Source::None => {}
    }
    if artifacts.dockerfile.is_some() || deployment.method == Method::Auto {
        uploads.push(format!("{}/Dockerfile", layout.app_dir(name)));
    }
    if artifacts.compose.is_some() {
        uploads.push(layout.compose_file(name));
    }
    if artifacts.unit.is_some() {
        uploads.push(layout.unit_file(name));
    }
    if artifacts.env.is_some() {
        uploads.push(layout.env_file(name));
    }
    let registry = vec![
        layout.garden_json(),
        layout.ports_json(),
        layout.app_json(name),
        layout.fragment(&deployment.route.host),
    ];
    Plan {
        port: reservation.port(),
        runtime: artifacts.runtime.map(|runtime| runtime.name),
        deployment,
        uploads,
        registry,
    }
}

/// Pushes source and artifacts. Everything here overwrites in place, so a
/// retry after a failure is safe.
async fn upload(
    deployment: &ResolvedDeployment,
    source: &Source,
    artifacts: Artifacts,
    service: &ReconciliationService,
) -> Result<Option<Runtime>, GardenError> {
    let transport = service.store.transport();
    let layout = service.store.layout();
    let name = &deployment.name;
    let source_dir = layout.source_dir(name);
    transport
        .run(&argv(["mkdir", "-p", &layout.app_dir(name), &layout.data_dir(name)]))
        .await?;

    match source {
        Source::Git { url, branch } => {
            info!("Cloning {url}");
            let branch = branch
                .as_deref()
                .map(|branch| format!("-b {} ", quote(branch)))
                .unwrap_or_default();
            transport
                .run(&sh(format!(
                    "rm -rf {dir} && git clone {branch}{} {dir}",
                    quote(url),
                    dir = quote(&source_dir)
                )))
                .await?;
        }
        Source::Local(path) => {
            info!("Uploading {}", path.display());
            transport
                .upload_directory(path, &source_dir, &deployment.exclude, deployment.gitignore)
                .await?;
        }
        Source::None => {}
    }

    let runtime = match (deployment.method, artifacts.runtime) {
        (Method::Auto, None) => Some(probe_runtime(transport, &source_dir, name).await?),
        (_, runtime) => runtime,
    };
    if let Some(runtime) = &runtime {
        info!("Detected runtime {}", runtime.name);
    }
    let dockerfile = match (artifacts.dockerfile, &runtime) {
        (Some(text), _) => Some(text),
        (None, Some(runtime)) => Some(dockerfile_for(deployment, runtime, service.renderer.as_ref())?),
        (None, None) => None,
    };

    if let Some(text) = dockerfile {
        transport
            .write_file(&generated_dockerfile(layout, name), text.as_bytes(), STATE_MODE)
            .await?;
    }
    if let Some(text) = artifacts.compose {
        transport
            .write_file(&layout.compose_file(name), text.as_bytes(), STATE_MODE)
            .await?;
    }
    if let Some(text) = artifacts.unit {
        transport
            .write_file(&layout.unit_file(name), text.as_bytes(), STATE_MODE)
            .await?;
    }
    if let Some(text) = artifacts.env {
        transport
            .write_file(&layout.env_file(name), text.as_bytes(), SECRET_MODE)
            .await?;
    }

    if deployment.method.builds_image() {
        build_image(transport, layout, name, deployment.method).await?;
    }
    if let (Method::Command, Some(setup_cmd)) = (deployment.method, &deployment.setup_cmd) {
        info!("Running setup command");
        let workdir = match source {
            Source::None => layout.app_dir(name),
            _ => source_dir,
        };
        transport
            .run(&sh(format!("cd {} && {setup_cmd}", quote(&workdir))))
            .await?;
    }
    Ok(runtime)
}

/// The generated Dockerfile lives next to the source, not inside it, so a
/// fresh upload of the source never removes it.
fn generated_dockerfile(layout: &RemoteLayout, name: &str) -> String {
    format!("{}/Dockerfile", layout.app_dir(name))
}

async fn probe_runtime(
    transport: &dyn RemoteTransport,
    source_dir: &str,
    name: &str,
) -> Result<Runtime, GardenError> {
    for runtime in runtime::RUNTIMES {
        let marker = format!("{source_dir}/{}", runtime.marker);
        if transport.run_command(&argv(["test", "-f", &marker])).await?.success() {
            return Ok(*runtime);
        }
    }
    Err(ConfigError::RuntimeNotDetected(name.to_string()).into())
}

async fn build_image(
    transport: &dyn RemoteTransport,
    layout: &RemoteLayout,
    name: &str,
    method: Method,
) -> Result<(), TransportError> {
    info!("Building image {}", image_name(name));
    let source_dir = layout.source_dir(name);
    let mut command = vec!["docker".to_string(), "build".into(), "-t".into(), image_name(name)];
    if method == Method::Auto {
        command.extend(["-f".to_string(), generated_dockerfile(layout, name)]);
    }
    command.push(source_dir);
    transport.run(&command).await.map(|_| ())
}

/// Commits the port, the record, its mirror and every affected fragment in
/// one transaction.
async fn register(
    lock: &RegistryLock,
    deployment: &ResolvedDeployment,
    source: &Source,
    reservation: Reservation,
    runtime: Option<Runtime>,
    service: &ReconciliationService,
) -> Result<AppRecord, GardenError> {
    let store = &service.store;
    let layout = store.layout();
    let name = &deployment.name;
    let Snapshot {
        mut garden,
        mut ports,
    } = store.snapshot(lock).await?;

    match reservation {
        Reservation::None => {
            ports.release(name);
        }
        Reservation::Registered(port) => {
            ports.release(name);
            ports.register(port, name)?;
        }
        Reservation::Allocated(port) => {
            if let Some(owner) = ports.allocated.get(&port).filter(|owner| *owner != name) {
                return Err(StateError::StaleRead(format!(
                    "port {port} was allocated to `{owner}` by another invocation"
                ))
                .into());
            }
            ports.release(name);
            ports.take(port, name);
        }
    }

    let previous = garden.apps.remove(name);
    let now = Utc::now();
    let record = AppRecord {
        name: name.clone(),
        method: deployment.method,
        url: deployment.url.clone(),
        port: reservation.port(),
        source_type: match source {
            Source::None => None,
            Source::Local(_) => Some(SourceType::Local),
            Source::Git { .. } => Some(SourceType::Git),
        },
        source: match source {
            Source::None => None,
            Source::Local(path) => Some(path.display().to_string()),
            Source::Git { url, .. } => Some(url.clone()),
        },
        branch: deployment.branch.clone(),
        created_at: previous.as_ref().map_or(now, |previous| previous.created_at),
        updated_at: now,
        environment: deployment.environment.clone(),
        routing: Some(deployment.route.kind()),
        container_port: deployment.container_port,
        source_path: (*source != Source::None).then(|| layout.source_dir(name)),
        systemd_unit: deployment.method.runs_service().then(|| unit_name(name)),
        runtime: runtime.map(|runtime| runtime.name.to_string()),
        gitignore: Some(deployment.gitignore),
        meta: deployment.meta.clone(),
        exclude: deployment.exclude.clone(),
        activated_at: previous.as_ref().and_then(|previous| previous.activated_at),
        extra: previous
            .as_ref()
            .map(|previous| previous.extra.clone())
            .unwrap_or_default(),
    };
    let mut hosts = BTreeSet::from([deployment.route.host.clone()]);
    if let Some(previous) = &previous {
        hosts.insert(previous.route()?.host);
    }
    garden.apps.insert(name.clone(), record.clone());
    routing::check_conflicts(&garden)?;

    let mut txn = Transaction::new();
    txn.put_json(&layout.garden_json(), &garden)?;
    txn.put_json(&layout.ports_json(), &ports)?;
    txn.put_json(&layout.app_json(name), &record)?;
    stage_fragments(&mut txn, &hosts, &garden, service)?;
    store.commit(lock, txn).await?;
    info!(
        "Registered {name}{}",
        record
            .port
            .map(|port| format!(" on port {port}"))
            .unwrap_or_default()
    );
    Ok(record)
}

fn stage_fragments(
    txn: &mut Transaction,
    hosts: &BTreeSet<String>,
    garden: &model::GardenRegistry,
    service: &ReconciliationService,
) -> Result<(), GardenError> {
    let layout = service.store.layout();
    for host in hosts {
        match routing::recompute(host, garden, service.renderer.as_ref())? {
            Some(text) => txn.put(&layout.fragment(host), text, STATE_MODE),
            None => txn.delete(&layout.fragment(host)),
        }
    }
    Ok(())
}

/// Installs and (re)starts the unit, then reloads the proxy. On success the
/// record is stamped as activated.
async fn activate(
    record: &AppRecord,
    restart_only: bool,
    service: &ReconciliationService,
) -> Result<(), GardenError> {
    let transport = service.store.transport();
    let layout = service.store.layout();
    if let Some(unit) = &record.systemd_unit {
        let installed = format!("{SYSTEMD_DIR}/{unit}");
        if !restart_only {
            transport
                .run(&argv([
                    "install",
                    "-m",
                    "644",
                    &layout.unit_file(&record.name),
                    &installed,
                ]))
                .await?;
            transport.run(&argv(["systemctl", "daemon-reload"])).await?;
            transport.run(&argv(["systemctl", "enable", unit])).await?;
        }
        transport.run(&argv(["systemctl", "restart", unit])).await?;
    }
    reload_proxy(transport).await?;
    stamp_activation(record, service).await;
    Ok(())
}

async fn reload_proxy(transport: &dyn RemoteTransport) -> Result<(), TransportError> {
    transport
        .run(&argv(["systemctl", "reload", "caddy"]))
        .await
        .map(|_| ())
}

/// Records a successful activation, unless another invocation has updated
/// the app in the meantime.
async fn stamp_activation(record: &AppRecord, service: &ReconciliationService) {
    if let Err(e) = try_stamp(record, service).await {
        warn!("{} is running but could not be marked active: {e}", record.name);
    }
}

async fn try_stamp(record: &AppRecord, service: &ReconciliationService) -> Result<(), GardenError> {
    let store = &service.store;
    let lock = store.lock().await?;
    let result = interruptible(async {
        let Snapshot { mut garden, .. } = store.snapshot(&lock).await?;
        let Some(current) = garden
            .apps
            .get_mut(&record.name)
            .filter(|current| current.updated_at == record.updated_at)
        else {
            return Ok(());
        };
        current.activated_at = Some(Utc::now());
        let current = current.clone();
        let mut txn = Transaction::new();
        txn.put_json(&store.layout().garden_json(), &garden)?;
        txn.put_json(&store.layout().app_json(&record.name), &current)?;
        store.commit(&lock, txn).await
    })
    .await;
    store.unlock(lock).await;
    result
}

fn partial(name: String, cause: GardenError) -> Outcome {
    let cause = GardenError::at(Stage::Activating)(cause);
    error!("{name} is registered but not running: {cause}");
    error!("Fix the problem, then run `appgarden apps redeploy {name}` or `appgarden apps remove {name}`");
    Outcome::PartialActivation { name, cause }
}

async fn redeploy(name: &str, service: &ReconciliationService) -> Result<Outcome, GardenError> {
    let store = &service.store;
    let transport = store.transport();
    let layout = store.layout();
    let record = store
        .garden()
        .await
        .and_then(|garden| {
            check_app_name(name)?;
            Ok(garden.app(name)?.clone())
        })
        .map_err(GardenError::at(Stage::Resolving))?;
    info!("Redeploying {name}");

    let refreshed = async {
        let source_dir = layout.source_dir(name);
        match (record.source_type, record.source.as_deref()) {
            (Some(SourceType::Git), _) => {
                transport
                    .run(&argv(["git", "-C", &source_dir, "pull", "--ff-only"]))
                    .await?;
            }
            (Some(SourceType::Local), Some(local)) => {
                let local = PathBuf::from(local);
                if !local.is_dir() {
                    return Err(ConfigError::SourceNotFound(local).into());
                }
                transport
                    .upload_directory(
                        &local,
                        &source_dir,
                        &record.exclude,
                        record.gitignore.unwrap_or(true),
                    )
                    .await?;
            }
            _ => {}
        }
        if record.method.builds_image() {
            build_image(transport, layout, name, record.method).await?;
        }
        Ok::<(), GardenError>(())
    };
    refreshed.await.map_err(GardenError::at(Stage::Uploading))?;

    let lock = store.lock().await.map_err(GardenError::at(Stage::Registering))?;
    let touched = interruptible(async {
        let Snapshot { mut garden, .. } = store.snapshot(&lock).await?;
        let current = garden
            .apps
            .get_mut(name)
            .ok_or_else(|| StateError::AppNotFound(name.to_string()))?;
        current.updated_at = Utc::now();
        let current = current.clone();
        let mut txn = Transaction::new();
        txn.put_json(&layout.garden_json(), &garden)?;
        txn.put_json(&layout.app_json(name), &current)?;
        store.commit(&lock, txn).await?;
        Ok(current)
    })
    .await;
    store.unlock(lock).await;
    let record = touched.map_err(GardenError::at(Stage::Registering))?;

    Ok(match activate(&record, true, service).await {
        Ok(()) => Outcome::Redeployed {
            name: name.to_string(),
        },
        Err(cause) => partial(name.to_string(), cause),
    })
}

async fn remove(name: &str, keep_data: bool, service: &ReconciliationService) -> Result<Outcome, GardenError> {
    let store = &service.store;
    let transport = store.transport();
    let layout = store.layout();
    check_app_name(name)?;
    let record = store.garden().await?.app(name)?.clone();
    info!("Removing {name}");

    if let Some(unit) = &record.systemd_unit {
        let installed = format!("{SYSTEMD_DIR}/{unit}");
        for command in [
            argv(["systemctl", "stop", unit]),
            argv(["systemctl", "disable", unit]),
            argv(["rm", "-f", &installed]),
            argv(["systemctl", "daemon-reload"]),
        ] {
            tolerate(transport, &command).await;
        }
    }
    if record.method.builds_image() {
        tolerate(transport, &argv(["docker", "rmi", "-f", &image_name(name)])).await;
    }

    let lock = store.lock().await.map_err(GardenError::at(Stage::Registering))?;
    let unregistered = interruptible(unregister(&lock, name, service)).await;
    store.unlock(lock).await;
    unregistered.map_err(GardenError::at(Stage::Registering))?;

    tolerate(transport, &argv(["systemctl", "reload", "caddy"])).await;
    let app_dir = layout.app_dir(name);
    let cleanup = if keep_data {
        sh(format!(
            "find {} -mindepth 1 -maxdepth 1 ! -name data -exec rm -rf {{}} +",
            quote(&app_dir)
        ))
    } else {
        argv(["rm", "-rf", &app_dir])
    };
    transport.run(&cleanup).await?;
    info!("Removed {name}");
    Ok(Outcome::Removed {
        name: name.to_string(),
    })
}

async fn unregister(
    lock: &RegistryLock,
    name: &str,
    service: &ReconciliationService,
) -> Result<(), GardenError> {
    let store = &service.store;
    let layout = store.layout();
    let Snapshot {
        mut garden,
        mut ports,
    } = store.snapshot(lock).await?;
    let record = garden
        .apps
        .remove(name)
        .ok_or_else(|| StateError::AppNotFound(name.to_string()))?;
    let freed = ports.release(name);
    debug!("Released ports {freed:?} of {name}");

    let mut txn = Transaction::new();
    txn.put_json(&layout.garden_json(), &garden)?;
    txn.put_json(&layout.ports_json(), &ports)?;
    txn.delete(&layout.app_json(name));
    stage_fragments(&mut txn, &BTreeSet::from([record.route()?.host]), &garden, service)?;
    store.commit(lock, txn).await
}

async fn tolerate(transport: &dyn RemoteTransport, command: &[String]) {
    if let Err(e) = transport.run(command).await {
        warn!("Ignoring failure: {e}");
    }
}

/// Runs a locked section, turning Ctrl-C into [`TransportError::Interrupted`]
/// so the caller still releases the lock.
async fn interruptible<T>(
    section: impl Future<Output = Result<T, GardenError>>,
) -> Result<T, GardenError> {
    tokio::select! {
        result = section => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted while holding the registry lock; run `appgarden repair` if the app looks inconsistent");
            Err(TransportError::Interrupted.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use indexmap::IndexMap;

    use super::*;
    use crate::{
        domain::{
            model::{Activation, AppLayer, GardenRegistry, PortTable},
            ports::DEFAULT_PORT_FLOOR,
        },
        infra::{memory::MemoryTransport, templates::AskamaRenderer},
    };

    const GARDEN: &str = "/srv/appgarden/garden.json";
    const PORTS: &str = "/srv/appgarden/ports.json";
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

    fn command_app(name: &str, layer: AppLayer) -> DeployRequest {
        DeployRequest {
            layers: Layers {
                cli: AppLayer {
                    name: Some(name.to_string()),
                    method: Some(Method::Command),
                    cmd: Some("node server.js".into()),
                    env: IndexMap::from([("API_KEY".to_string(), "s3cret".to_string())]),
                    ..layer
                },
                ..Default::default()
            },
            environment: None,
            server_domain: Some("example.com".into()),
            project_root: PathBuf::from("."),
            dry_run: false,
        }
    }

    fn subdomain(subdomain: &str) -> AppLayer {
        AppLayer {
            subdomain: Some(subdomain.into()),
            ..Default::default()
        }
    }

    fn path(path: &str) -> AppLayer {
        AppLayer {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    fn garden(transport: &MemoryTransport) -> GardenRegistry {
        serde_json::from_str(&transport.text(GARDEN).unwrap()).unwrap()
    }

    fn ports(transport: &MemoryTransport) -> PortTable {
        serde_json::from_str(&transport.text(PORTS).unwrap()).unwrap()
    }

    async fn deploy_ok(request: DeployRequest, service: &ReconciliationService) -> Outcome {
        let outcome = reconcile(Event::Deploy(request), service).await.unwrap();
        assert!(matches!(outcome, Outcome::Deployed { .. }), "{outcome:?}");
        outcome
    }

    #[tokio::test]
    async fn deploys_a_command_app() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        match deploy_ok(command_app("blog", subdomain("blog")), &service).await {
            Outcome::Deployed { url, port, .. } => {
                assert_eq!(url, "blog.example.com");
                assert_eq!(port, Some(10000));
            }
            other => panic!("unexpected {other:?}"),
        }

        let record = garden(&transport).apps["blog"].clone();
        assert_eq!(record.activation(), Activation::Activated);
        assert_eq!(record.systemd_unit.as_deref(), Some("appgarden-blog.service"));
        assert_eq!(ports(&transport).allocated[&10000], "blog");
        assert_eq!(ports(&transport).next_port, 10001);

        let env = transport.text("/srv/appgarden/apps/blog/.env").unwrap();
        assert_eq!(env, "PORT=10000\nAPI_KEY=s3cret\n");
        assert_eq!(transport.mode("/srv/appgarden/apps/blog/.env"), Some(0o600));
        assert!(!transport.text(GARDEN).unwrap().contains("s3cret"));
        assert!(transport
            .text("/srv/appgarden/caddy/apps/blog.example.com.caddy")
            .unwrap()
            .contains("reverse_proxy localhost:10000"));
        assert!(transport.exists("/srv/appgarden/apps/blog/app.json"));

        let commands = transport.commands();
        assert!(commands.contains(&"systemctl restart appgarden-blog.service".to_string()));
        assert!(commands.contains(&"systemctl reload caddy".to_string()));
        assert!(!transport.lock_held(LOCK));
    }

    #[tokio::test]
    async fn subdirectory_apps_share_one_fragment() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(command_app("api", path("api")), &service).await;
        deploy_ok(command_app("api-v2", path("/api/v2")), &service).await;

        let fragment = transport
            .text("/srv/appgarden/caddy/apps/example.com.caddy")
            .unwrap();
        let v2 = fragment.find("handle_path /api/v2/*").unwrap();
        let v1 = fragment.find("handle_path /api/*").unwrap();
        assert!(v2 < v1, "{fragment}");
        assert_eq!(ports(&transport).allocated.len(), 2);
    }

    #[tokio::test]
    async fn resolution_failure_touches_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let request = command_app(
            "blog",
            AppLayer {
                url: Some("blog.example.com".into()),
                path: Some("blog".into()),
                ..Default::default()
            },
        );
        let error = reconcile(Event::Deploy(request), &service).await.unwrap_err();
        match error {
            GardenError::Failed { stage, cause } => {
                assert_eq!(stage, Stage::Resolving);
                assert!(matches!(*cause, GardenError::Config(ConfigError::AmbiguousRouting(_))));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(transport.commands().is_empty());
        assert!(transport.files().is_empty());
    }

    #[tokio::test]
    async fn failed_activation_stays_registered_and_pending() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_command("systemctl restart");
        let service = service(&transport);
        let outcome = reconcile(Event::Deploy(command_app("blog", subdomain("blog"))), &service)
            .await
            .unwrap();
        match outcome {
            Outcome::PartialActivation { name, cause } => {
                assert_eq!(name, "blog");
                assert!(matches!(cause, GardenError::Failed { stage: Stage::Activating, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        let record = garden(&transport).apps["blog"].clone();
        assert_eq!(record.activation(), Activation::Pending);
        assert_eq!(ports(&transport).allocated[&10000], "blog");
        assert!(!transport.lock_held(LOCK));
    }

    #[tokio::test]
    async fn failed_staging_releases_the_lock_and_commits_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_writes_to(PORTS);
        let service = service(&transport);
        let error = reconcile(Event::Deploy(command_app("blog", subdomain("blog"))), &service)
            .await
            .unwrap_err();
        assert!(matches!(error, GardenError::Failed { stage: Stage::Registering, .. }));
        assert!(!transport.lock_held(LOCK));
        assert!(!transport.exists(GARDEN));
        assert!(!transport.exists(PORTS));
        assert!(!transport.exists("/srv/appgarden/apps/blog/app.json"));
        assert!(transport.files().iter().all(|path| !path.contains(".tmp-")));
        assert!(!transport.commands().iter().any(|command| command.contains("systemctl restart")));
    }

    #[tokio::test]
    async fn failed_unregister_releases_the_lock_and_keeps_the_app() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(command_app("blog", subdomain("blog")), &service).await;
        let registry = transport.text(GARDEN).unwrap();
        let table = transport.text(PORTS).unwrap();

        transport.fail_writes_to(PORTS);
        let error = reconcile(
            Event::Remove {
                name: "blog".into(),
                keep_data: false,
            },
            &service,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, GardenError::Failed { stage: Stage::Registering, .. }));
        assert!(!transport.lock_held(LOCK));
        assert_eq!(transport.text(GARDEN).unwrap(), registry);
        assert_eq!(transport.text(PORTS).unwrap(), table);
        assert!(transport.exists("/srv/appgarden/caddy/apps/blog.example.com.caddy"));
        assert!(transport.files().iter().all(|path| !path.contains(".tmp-")));
    }

    #[tokio::test]
    async fn unsafe_names_are_never_removed() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        transport.put(GARDEN, r#"{"apps": {}}"#);
        let error = reconcile(
            Event::Remove {
                name: "..".into(),
                keep_data: false,
            },
            &service,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, GardenError::Config(ConfigError::InvalidAppName(_))));
        assert!(!transport.commands().iter().any(|command| command.contains("rm -rf")));
    }

    #[tokio::test]
    async fn port_taken_meanwhile_is_a_stale_read() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let request = command_app("blog", subdomain("blog"));
        let deployment = resolve(&request.layers, None, Some("example.com")).unwrap();
        let reservation = reserve(&deployment, &service).await.unwrap();
        assert_eq!(reservation, Reservation::Allocated(10000));

        transport.put(PORTS, r#"{"next_port": 10001, "allocated": {"10000": "shop"}}"#);
        let lock = service.store.lock().await.unwrap();
        let result = register(&lock, &deployment, &Source::None, reservation, None, &service).await;
        service.store.unlock(lock).await;
        assert!(matches!(result, Err(GardenError::State(StateError::StaleRead(_)))));
        assert!(!transport.exists(GARDEN));
    }

    #[tokio::test]
    async fn held_lock_fails_registering_without_mutation() {
        let transport = Arc::new(MemoryTransport::new());
        transport.hold_lock(LOCK, "alice pid 7");
        let service = service(&transport);
        let error = reconcile(Event::Deploy(command_app("blog", subdomain("blog"))), &service)
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        match error {
            GardenError::Failed { stage, cause } => {
                assert_eq!(stage, Stage::Registering);
                assert!(cause.to_string().contains("held by alice pid 7"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!transport.exists(GARDEN));
        assert!(transport.exists("/srv/appgarden/apps/blog/.env"));
    }

    #[tokio::test]
    async fn same_route_is_rejected_before_any_upload() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(command_app("blog", subdomain("blog")), &service).await;
        let before = transport.commands().len();
        let error = reconcile(Event::Deploy(command_app("other", subdomain("blog"))), &service)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            GardenError::Failed { stage: Stage::Allocating, ref cause }
                if matches!(**cause, GardenError::State(StateError::RouteConflict { .. }))
        ));
        assert_eq!(transport.commands().len(), before);
    }

    #[tokio::test]
    async fn user_port_is_registered_without_moving_the_counter() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(
            command_app(
                "blog",
                AppLayer {
                    port: Some(8080),
                    ..subdomain("blog")
                },
            ),
            &service,
        )
        .await;
        let table = ports(&transport);
        assert_eq!(table.allocated[&8080], "blog");
        assert_eq!(table.next_port, u32::from(DEFAULT_PORT_FLOOR));

        let error = reconcile(
            Event::Deploy(command_app(
                "shop",
                AppLayer {
                    port: Some(8080),
                    ..subdomain("shop")
                },
            )),
            &service,
        )
        .await
        .unwrap_err();
        assert!(error.to_string().contains("already allocated to `blog`"));
    }

    #[tokio::test]
    async fn moving_an_app_rewrites_both_hosts() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(command_app("blog", subdomain("blog")), &service).await;
        let created = garden(&transport).apps["blog"].created_at;
        deploy_ok(command_app("blog", path("blog")), &service).await;

        assert!(!transport.exists("/srv/appgarden/caddy/apps/blog.example.com.caddy"));
        assert!(transport
            .text("/srv/appgarden/caddy/apps/example.com.caddy")
            .unwrap()
            .contains("handle_path /blog/*"));
        let record = garden(&transport).apps["blog"].clone();
        assert_eq!(record.created_at, created);
        assert_eq!(record.port, Some(10000));
    }

    #[tokio::test]
    async fn removal_leaves_the_rest_of_the_host() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(command_app("api", path("api")), &service).await;
        deploy_ok(command_app("docs", path("docs")), &service).await;
        transport.put("/srv/appgarden/apps/api/data/db.sqlite", "rows");

        let outcome = reconcile(
            Event::Remove {
                name: "api".into(),
                keep_data: false,
            },
            &service,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, Outcome::Removed { .. }));

        let registry = garden(&transport);
        assert!(!registry.apps.contains_key("api"));
        assert!(!ports(&transport).allocated.values().any(|owner| owner == "api"));
        let fragment = transport
            .text("/srv/appgarden/caddy/apps/example.com.caddy")
            .unwrap();
        assert!(!fragment.contains("/api"));
        assert!(fragment.contains("handle_path /docs/*"));
        assert!(!transport.exists("/srv/appgarden/apps/api/app.json"));
        assert!(!transport.exists("/srv/appgarden/apps/api/data/db.sqlite"));
        assert!(transport
            .commands()
            .contains(&"systemctl disable appgarden-api.service".to_string()));
    }

    #[tokio::test]
    async fn removing_the_last_app_deletes_the_fragment() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        deploy_ok(command_app("blog", subdomain("blog")), &service).await;
        reconcile(
            Event::Remove {
                name: "blog".into(),
                keep_data: true,
            },
            &service,
        )
        .await
        .unwrap();
        assert!(!transport.exists("/srv/appgarden/caddy/apps/blog.example.com.caddy"));
        assert!(transport
            .commands()
            .iter()
            .any(|command| command.contains("! -name data")));
    }

    #[tokio::test]
    async fn removing_an_unknown_app_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let error = reconcile(
            Event::Remove {
                name: "ghost".into(),
                keep_data: false,
            },
            &service,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, GardenError::State(StateError::AppNotFound(_))));
    }

    #[tokio::test]
    async fn redeploy_touches_only_source_and_timestamps() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let request = command_app(
            "site",
            AppLayer {
                source: Some("https://github.com/user/site.git".into()),
                branch: Some("main".into()),
                ..subdomain("site")
            },
        );
        deploy_ok(request, &service).await;
        let before = garden(&transport).apps["site"].clone();
        assert!(transport
            .commands()
            .iter()
            .any(|command| command.contains("git clone -b main https://github.com/user/site.git")));

        let outcome = reconcile(Event::Redeploy("site".into()), &service).await.unwrap();
        assert!(matches!(outcome, Outcome::Redeployed { .. }));
        let after = garden(&transport).apps["site"].clone();
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.port, before.port);
        assert_eq!(after.url, before.url);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.activation(), Activation::Activated);
        assert!(transport.commands().iter().any(|command| command
            == "git -C /srv/appgarden/apps/site/source pull --ff-only"));
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let mut request = command_app("blog", subdomain("blog"));
        request.dry_run = true;
        match reconcile(Event::Deploy(request), &service).await.unwrap() {
            Outcome::Planned(plan) => {
                assert_eq!(plan.port, Some(10000));
                assert!(plan
                    .registry
                    .contains(&"/srv/appgarden/caddy/apps/blog.example.com.caddy".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(transport.files().is_empty());
    }

    #[tokio::test]
    async fn static_site_is_served_from_its_source() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let site = tempfile::tempdir().unwrap();
        fs::write(site.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let request = DeployRequest {
            layers: Layers {
                cli: AppLayer {
                    name: Some("docs".into()),
                    method: Some(Method::Static),
                    source: Some(site.path().display().to_string()),
                    exclude: vec!["*.draft".into()],
                    ..path("docs")
                },
                ..Default::default()
            },
            environment: None,
            server_domain: Some("example.com".into()),
            project_root: PathBuf::from("."),
            dry_run: false,
        };
        deploy_ok(request, &service).await;

        let uploads = transport.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].remote, "/srv/appgarden/apps/docs/source");
        assert_eq!(uploads[0].exclude, vec!["*.draft"]);
        assert!(uploads[0].gitignore);
        assert!(ports(&transport).allocated.is_empty());
        assert!(!transport.exists("/srv/appgarden/apps/docs/.env"));
        assert!(transport
            .text("/srv/appgarden/caddy/apps/example.com.caddy")
            .unwrap()
            .contains("file_server"));
    }

    #[tokio::test]
    async fn auto_app_gets_a_generated_dockerfile() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport);
        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join("package.json"), "{}").unwrap();
        let request = DeployRequest {
            layers: Layers {
                cli: AppLayer {
                    name: Some("shop".into()),
                    method: Some(Method::Auto),
                    source: Some(".".into()),
                    cmd: Some("npm start".into()),
                    container_port: Some(3000),
                    ..subdomain("shop")
                },
                ..Default::default()
            },
            environment: None,
            server_domain: Some("example.com".into()),
            project_root: project.path().to_path_buf(),
            dry_run: false,
        };
        deploy_ok(request, &service).await;

        let dockerfile = transport.text("/srv/appgarden/apps/shop/Dockerfile").unwrap();
        assert!(dockerfile.starts_with("FROM node:22"));
        assert_eq!(
            transport.text("/srv/appgarden/apps/shop/.env").unwrap(),
            "PORT=3000\n"
        );
        assert!(transport
            .text("/srv/appgarden/apps/shop/docker-compose.yml")
            .unwrap()
            .contains("127.0.0.1:10000:3000"));
        assert_eq!(garden(&transport).apps["shop"].runtime.as_deref(), Some("nodejs"));
        assert!(transport.commands().iter().any(|command| command.starts_with(
            "docker build -t appgarden-shop -f /srv/appgarden/apps/shop/Dockerfile"
        )));
    }
}
