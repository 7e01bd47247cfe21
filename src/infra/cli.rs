use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Error};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use log::{info, warn};

use crate::{
    config::{save_config, AppConfig, InitConfig, ServerConfig},
    domain::{
        apps::{self, ServiceAction},
        error::ConfigError,
        model::{AppLayer, Method},
        port::RemoteTransport,
        project::ProjectConfig,
        registry::RegistryStore,
        remote::RemoteLayout,
        resolve::{resolve, Layers, PRODUCTION},
        server, reconcile, DeployRequest, Event, Outcome, ReconciliationService,
    },
    infra::{ssh::SshTransport, templates::AskamaRenderer},
};

/// Deploy apps to your own servers over SSH.
#[derive(Debug, Parser)]
#[command(name = "appgarden", version)]
pub struct Cli {
    /// Log every remote step.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Global config file (default ~/.config/appgarden/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy the app described by appgarden.toml and flags.
    Deploy(DeployArgs),
    /// Inspect and operate deployed apps.
    Apps {
        #[arg(long, global = true)]
        server: Option<String>,
        #[command(subcommand)]
        command: AppsCommand,
    },
    /// Environments of the project in the current directory.
    Env {
        #[arg(long, global = true, default_value = ".")]
        project: PathBuf,
        #[command(subcommand)]
        command: EnvCommand,
    },
    /// Manage configured servers.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// Inspect the global configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Rebuild ports and proxy fragments from the app registry.
    Repair {
        #[arg(long)]
        server: Option<String>,
        /// Remove the registry lock even if another invocation holds it.
        #[arg(long)]
        force_unlock: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location and the loaded configuration.
    Show,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Environment from appgarden.toml, production when omitted.
    pub environment: Option<String>,
    #[arg(long)]
    pub server: Option<String>,
    /// Project directory or appgarden.toml file.
    #[arg(long, default_value = ".")]
    pub project: PathBuf,
    /// Print the plan without changing the server.
    #[arg(long)]
    pub dry_run: bool,
    #[command(flatten)]
    pub layer: LayerArgs,
}

/// Settings given on the command line, the highest configuration layer.
#[derive(Debug, Default, Args)]
pub struct LayerArgs {
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub method: Option<Method>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub branch: Option<String>,
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long)]
    pub subdomain: Option<String>,
    #[arg(long)]
    pub path: Option<String>,
    #[arg(long)]
    pub domain: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub container_port: Option<u16>,
    #[arg(long)]
    pub cmd: Option<String>,
    #[arg(long)]
    pub setup_cmd: Option<String>,
    #[arg(long)]
    pub env_file: Option<String>,
    /// Environment variable for the app, repeatable.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
    #[arg(long, value_name = "KEY=VALUE")]
    pub meta: Vec<String>,
    #[arg(long, value_name = "GLOB")]
    pub exclude: Vec<String>,
    #[arg(long)]
    pub volume: Vec<String>,
    /// Upload files even if .gitignore excludes them.
    #[arg(long)]
    pub no_gitignore: bool,
}

impl LayerArgs {
    pub fn into_layer(self) -> Result<AppLayer, Error> {
        Ok(AppLayer {
            name: self.name,
            method: self.method,
            source: self.source,
            branch: self.branch,
            url: self.url,
            subdomain: self.subdomain,
            path: self.path,
            domain: self.domain,
            port: self.port,
            container_port: self.container_port,
            cmd: self.cmd,
            setup_cmd: self.setup_cmd,
            env_file: self.env_file,
            gitignore: self.no_gitignore.then_some(false),
            env: pairs("--var", &self.vars)?,
            meta: pairs("--meta", &self.meta)?,
            exclude: self.exclude,
            volumes: self.volume,
            ..Default::default()
        })
    }
}

fn pairs(flag: &str, items: &[String]) -> Result<IndexMap<String, String>, Error> {
    items
        .iter()
        .map(|item| {
            item.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("{flag} expects KEY=VALUE, got `{item}`"))
        })
        .collect()
}

#[derive(Debug, Subcommand)]
pub enum AppsCommand {
    List,
    Status { name: String },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
    /// Stop and unregister an app, deleting its files.
    Remove {
        name: String,
        /// Keep the app's data directory.
        #[arg(long)]
        keep_data: bool,
    },
    /// Pull or re-upload the source, rebuild and restart.
    Redeploy { name: String },
}

#[derive(Debug, Subcommand)]
pub enum EnvCommand {
    List,
    /// Print the resolved configuration of an environment.
    Show {
        environment: String,
        #[arg(long)]
        server: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ServerCommand {
    Add(ServerArgs),
    List,
    Remove { name: String },
    /// Make a server the default target.
    Default { name: String },
    Ping { name: Option<String> },
    /// Install Docker, Caddy and hardening, and prepare the app root.
    Init { name: Option<String> },
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    pub name: String,
    #[arg(long, required_unless_present = "hcloud_name")]
    pub host: Option<String>,
    #[arg(long, requires = "hcloud_context", conflicts_with = "host")]
    pub hcloud_name: Option<String>,
    #[arg(long)]
    pub hcloud_context: Option<String>,
    #[arg(long, default_value = "root")]
    pub ssh_user: String,
    #[arg(long)]
    pub ssh_key: Option<String>,
    /// Base domain apps are served under.
    #[arg(long)]
    pub domain: String,
    #[arg(long)]
    pub app_root: Option<String>,
    /// Init step to skip, repeatable.
    #[arg(long = "skip", value_name = "STEP")]
    pub skip: Vec<String>,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        ServerConfig {
            host: args.host,
            hcloud_name: args.hcloud_name,
            hcloud_context: args.hcloud_context,
            ssh_user: args.ssh_user,
            ssh_key: args.ssh_key,
            domain: args.domain,
            app_root: args.app_root,
            init: InitConfig {
                skip: args.skip.into_iter().collect(),
            },
        }
    }
}

pub async fn run(cli: Cli, config_path: &Path, mut config: AppConfig) -> Result<(), Error> {
    match cli.command {
        Command::Deploy(args) => deploy(args, &config).await,
        Command::Apps { server, command } => {
            let service = connect(&config, server.as_deref()).await?;
            apps_command(command, &service).await
        }
        Command::Env { project, command } => env_command(command, &project, &config),
        Command::Server { command } => server_command(command, config_path, &mut config).await,
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            print!("{}", show_config(config_path, &config)?);
            Ok(())
        }
        Command::Repair {
            server,
            force_unlock,
        } => {
            let service = connect(&config, server.as_deref()).await?;
            let report = apps::repair(&service, force_unlock).await?;
            for (port, owner) in &report.dropped_ports {
                println!("dropped port {port} (owner `{owner}` is not registered)");
            }
            for (port, owner) in &report.restored_ports {
                println!("restored port {port} for `{owner}`");
            }
            for path in &report.removed_fragments {
                println!("removed stale fragment {path}");
            }
            println!("rewrote {} proxy fragments", report.fragments.len());
            Ok(())
        }
    }
}

fn show_config(path: &Path, config: &AppConfig) -> Result<String, Error> {
    let origin = if path.exists() {
        format!("# {}\n", path.display())
    } else {
        format!("# {} (not found, showing defaults)\n", path.display())
    };
    let text = toml::to_string_pretty(config).context("Can't serialize configuration")?;
    Ok(format!("{origin}{text}"))
}

async fn connect(config: &AppConfig, server: Option<&str>) -> Result<ReconciliationService, Error> {
    let (name, server) = config.server(server)?;
    let transport = SshTransport::connect(server)
        .await
        .with_context(|| format!("Can't reach server `{name}`"))?;
    info!("Using server {name} ({})", transport.host());
    Ok(ReconciliationService {
        store: RegistryStore::new(
            Arc::new(transport),
            RemoteLayout::new(server.app_root()),
            config.port_floor,
            config.lock_timeout(),
        ),
        renderer: Box::new(AskamaRenderer),
    })
}

fn load_project(path: &Path) -> Result<Option<ProjectConfig>, ConfigError> {
    match ProjectConfig::load(path) {
        Ok(project) => Ok(Some(project)),
        Err(ConfigError::ProjectNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Layers, environment and source root for a deploy. With a project file the
/// environment defaults to production, which need not be declared.
fn deploy_layers(
    config: &AppConfig,
    project: Option<ProjectConfig>,
    environment: Option<String>,
    cli: AppLayer,
    fallback_root: &Path,
) -> Result<(Layers, Option<String>, PathBuf), Error> {
    match project {
        Some(project) => {
            let environment = environment.unwrap_or_else(|| PRODUCTION.to_string());
            let layer = match project.environment(&environment) {
                Ok(layer) => layer.clone(),
                Err(_) if environment == PRODUCTION => AppLayer::default(),
                Err(e) => return Err(e.into()),
            };
            Ok((
                Layers {
                    global: config.defaults.clone(),
                    app: project.app,
                    environment: layer,
                    cli,
                },
                Some(environment),
                project.root,
            ))
        }
        None => {
            if let Some(environment) = environment {
                bail!(
                    "environment `{environment}` given but no appgarden.toml found in {}",
                    fallback_root.display()
                );
            }
            Ok((
                Layers {
                    global: config.defaults.clone(),
                    cli,
                    ..Default::default()
                },
                None,
                fallback_root.to_path_buf(),
            ))
        }
    }
}

async fn deploy(args: DeployArgs, config: &AppConfig) -> Result<(), Error> {
    let project = load_project(&args.project)?;
    let (layers, environment, project_root) = deploy_layers(
        config,
        project,
        args.environment,
        args.layer.into_layer()?,
        &args.project,
    )?;
    let server = args.server.or_else(|| layers.selected_server());
    let (_, server_config) = config.server(server.as_deref())?;
    let request = DeployRequest {
        server_domain: Some(server_config.domain.clone()),
        layers,
        environment,
        project_root,
        dry_run: args.dry_run,
    };
    let service = connect(config, server.as_deref()).await?;
    report(reconcile(Event::Deploy(request), &service).await?)
}

fn report(outcome: Outcome) -> Result<(), Error> {
    match outcome {
        Outcome::Deployed { name, url, port } => {
            match port {
                Some(port) => println!("{name} deployed at https://{url} (port {port})"),
                None => println!("{name} deployed at https://{url}"),
            }
            Ok(())
        }
        Outcome::Planned(plan) => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Outcome::Redeployed { name } => {
            println!("{name} redeployed");
            Ok(())
        }
        Outcome::Removed { name } => {
            println!("{name} removed");
            Ok(())
        }
        Outcome::PartialActivation { name, cause } => Err(anyhow!(
            "{name} is registered but not running: {cause}"
        )),
    }
}

async fn apps_command(command: AppsCommand, service: &ReconciliationService) -> Result<(), Error> {
    let store = &service.store;
    match command {
        AppsCommand::List => {
            let statuses = apps::list(store).await?;
            if statuses.is_empty() {
                println!("no apps deployed");
            }
            for status in statuses {
                let record = &status.record;
                println!(
                    "{:<24} {:<15} {:<40} {:<6} {}",
                    record.name,
                    record.method.as_str(),
                    record.url,
                    record.port.map(|port| port.to_string()).unwrap_or_default(),
                    status.service
                );
            }
            Ok(())
        }
        AppsCommand::Status { name } => {
            let status = apps::status(store, &name).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        AppsCommand::Start { name } => apps::control(store, &name, ServiceAction::Start).await.map_err(Error::from),
        AppsCommand::Stop { name } => apps::control(store, &name, ServiceAction::Stop).await.map_err(Error::from),
        AppsCommand::Restart { name } => {
            apps::control(store, &name, ServiceAction::Restart).await.map_err(Error::from)
        }
        AppsCommand::Logs { name, lines } => {
            print!("{}", apps::logs(store, &name, lines).await?);
            Ok(())
        }
        AppsCommand::Remove { name, keep_data } => {
            report(reconcile(Event::Remove { name, keep_data }, service).await?)
        }
        AppsCommand::Redeploy { name } => report(reconcile(Event::Redeploy(name), service).await?),
    }
}

fn env_command(command: EnvCommand, project_path: &Path, config: &AppConfig) -> Result<(), Error> {
    let project = ProjectConfig::load(project_path)?;
    match command {
        EnvCommand::List => {
            if !project.environments.contains_key(PRODUCTION) {
                println!("{PRODUCTION} (implicit)");
            }
            for name in project.environment_names() {
                println!("{name}");
            }
            Ok(())
        }
        EnvCommand::Show {
            environment,
            server,
        } => {
            let (layers, environment, _) = deploy_layers(
                config,
                Some(project),
                Some(environment),
                AppLayer::default(),
                project_path,
            )?;
            let server = server.or_else(|| layers.selected_server());
            let domain = match config.server(server.as_deref()) {
                Ok((_, server)) => Some(server.domain.clone()),
                Err(e) => {
                    warn!("{e}; resolving without a server domain");
                    None
                }
            };
            let deployment = resolve(&layers, environment.as_deref(), domain.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
            Ok(())
        }
    }
}

async fn server_command(
    command: ServerCommand,
    config_path: &Path,
    config: &mut AppConfig,
) -> Result<(), Error> {
    match command {
        ServerCommand::Add(args) => {
            let name = args.name.clone();
            let server = ServerConfig::from(args);
            server.validate(&name)?;
            if config.servers.insert(name.clone(), server).is_some() {
                warn!("Replacing server `{name}`");
            }
            if config.default_server.is_none() {
                config.default_server = Some(name.clone());
            }
            save_config(config_path, config)?;
            println!("server `{name}` added");
            Ok(())
        }
        ServerCommand::List => {
            if config.servers.is_empty() {
                println!("no servers configured");
            }
            for (name, server) in &config.servers {
                let address = match (&server.host, &server.hcloud_name) {
                    (Some(host), _) => host.clone(),
                    (None, Some(hcloud)) => format!("hcloud:{hcloud}"),
                    (None, None) => "?".to_string(),
                };
                let marker = if config.default_server.as_deref() == Some(name) {
                    " (default)"
                } else {
                    ""
                };
                println!("{name:<16} {}@{address:<24} {}{marker}", server.ssh_user, server.domain);
            }
            Ok(())
        }
        ServerCommand::Remove { name } => {
            config
                .servers
                .remove(&name)
                .ok_or_else(|| ConfigError::UnknownServer(name.clone()))?;
            if config.default_server.as_deref() == Some(name.as_str()) {
                config.default_server = None;
            }
            save_config(config_path, config)?;
            println!("server `{name}` removed");
            Ok(())
        }
        ServerCommand::Default { name } => {
            config.server(Some(&name))?;
            config.default_server = Some(name.clone());
            save_config(config_path, config)?;
            println!("`{name}` is now the default server");
            Ok(())
        }
        ServerCommand::Ping { name } => {
            let service = connect(config, name.as_deref()).await?;
            let elapsed = server::ping(service.store.transport()).await?;
            println!("ok ({} ms)", elapsed.as_millis());
            Ok(())
        }
        ServerCommand::Init { name } => {
            let skip: BTreeSet<String> = config.server(name.as_deref())?.1.init.skip.clone();
            let service = connect(config, name.as_deref()).await?;
            let report =
                server::init(&service.store, service.renderer.as_ref(), &skip).await?;
            println!("ran: {}", report.ran.join(", "));
            if !report.skipped.is_empty() {
                println!("skipped: {}", report.skipped.join(", "));
            }
            for path in &report.created {
                println!("created {path}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_show_names_the_file_and_its_servers() {
        let cli = Cli::try_parse_from(["appgarden", "config", "show"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config {
                command: ConfigCommand::Show
            }
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let missing = show_config(&path, &AppConfig::default()).unwrap();
        assert!(missing.starts_with(&format!("# {} (not found", path.display())));

        fs::write(&path, "[servers.prod]\nhost = \"203.0.113.10\"\ndomain = \"example.com\"\n").unwrap();
        let config = crate::config::load_config(&path).unwrap();
        let shown = show_config(&path, &config).unwrap();
        assert!(shown.starts_with(&format!("# {}\n", path.display())));
        assert!(shown.contains("[servers.prod]"));
        assert!(shown.contains("host = \"203.0.113.10\""));
    }

    #[test]
    fn deploy_flags_become_the_cli_layer() {
        let cli = Cli::try_parse_from([
            "appgarden",
            "deploy",
            "staging",
            "--method",
            "command",
            "--cmd",
            "node server.js",
            "--var",
            "API_KEY=abc=def",
            "--exclude",
            "*.log",
            "--no-gitignore",
            "--dry-run",
        ])
        .unwrap();
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.environment.as_deref(), Some("staging"));
        assert!(args.dry_run);
        let layer = args.layer.into_layer().unwrap();
        assert_eq!(layer.method, Some(Method::Command));
        assert_eq!(layer.env["API_KEY"], "abc=def");
        assert_eq!(layer.exclude, vec!["*.log"]);
        assert_eq!(layer.gitignore, Some(false));
    }

    #[test]
    fn bad_pairs_are_rejected() {
        let args = LayerArgs {
            vars: vec!["NOVALUE".into()],
            ..Default::default()
        };
        let error = args.into_layer().unwrap_err();
        assert_eq!(error.to_string(), "--var expects KEY=VALUE, got `NOVALUE`");
    }

    #[test]
    fn unknown_method_is_a_parse_error() {
        assert!(Cli::try_parse_from(["appgarden", "deploy", "--method", "lambda"]).is_err());
    }

    #[test]
    fn server_add_needs_an_address() {
        assert!(Cli::try_parse_from(["appgarden", "server", "add", "prod", "--domain", "example.com"]).is_err());
        let cli = Cli::try_parse_from([
            "appgarden",
            "server",
            "add",
            "cloud",
            "--hcloud-name",
            "garden-1",
            "--hcloud-context",
            "personal",
            "--domain",
            "example.com",
            "--skip",
            "fail2ban",
        ])
        .unwrap();
        let Command::Server {
            command: ServerCommand::Add(args),
        } = cli.command
        else {
            panic!("expected server add");
        };
        let server = ServerConfig::from(args);
        assert!(server.validate("cloud").is_ok());
        assert!(server.init.skip.contains("fail2ban"));
        assert_eq!(server.ssh_user, "root");
    }

    const PROJECT: &str = r#"
[app]
name = "blog"
method = "command"
cmd = "node server.js"
subdomain = "{app.name}"

[environments.staging]
server = "staging-box"
"#;

    #[test]
    fn project_environment_defaults_to_production() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("appgarden.toml"), PROJECT).unwrap();
        let config = AppConfig::default();

        let project = load_project(dir.path()).unwrap();
        let (layers, environment, root) =
            deploy_layers(&config, project, None, AppLayer::default(), Path::new(".")).unwrap();
        assert_eq!(environment.as_deref(), Some(PRODUCTION));
        assert_eq!(root, dir.path());
        let deployment = resolve(&layers, environment.as_deref(), Some("example.com")).unwrap();
        assert_eq!(deployment.url, "blog.example.com");

        let project = load_project(dir.path()).unwrap();
        let (layers, environment, _) = deploy_layers(
            &config,
            project,
            Some("staging".into()),
            AppLayer::default(),
            Path::new("."),
        )
        .unwrap();
        assert_eq!(layers.selected_server().as_deref(), Some("staging-box"));
        let deployment = resolve(&layers, environment.as_deref(), Some("example.com")).unwrap();
        assert_eq!(deployment.name, "blog-staging");
        assert_eq!(deployment.url, "blog-staging.example.com");

        let project = load_project(dir.path()).unwrap();
        assert!(deploy_layers(&config, project, Some("qa".into()), AppLayer::default(), Path::new(".")).is_err());
    }

    #[test]
    fn environment_without_project_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_project(dir.path()).unwrap().is_none());
        let error = deploy_layers(
            &AppConfig::default(),
            None,
            Some("staging".into()),
            AppLayer::default(),
            dir.path(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("no appgarden.toml"));
    }
}
