//! chectl - Eclipse Che lifecycle CLI

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chectl::config::OrchestratorConfig;
use chectl::orchestrator::Orchestrator;
use chectl::platform::{Installer, Platform};
use chectl::task::RendererKind;

/// chectl - install, start, stop and remove Eclipse Che on a cluster
#[derive(Parser, Debug)]
#[command(name = "chectl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Control the Che server
    #[command(subcommand)]
    Server(ServerCommand),
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Start Che, installing it first when it is not deployed
    Start(StartArgs),
    /// Stop Che by scaling every component to zero
    Stop(CommonArgs),
    /// Delete every Che resource from the namespace
    Delete(CommonArgs),
    /// Report what is deployed and whether Che is running
    Status(CommonArgs),
}

/// Flags shared by every server command
///
/// Values left unset fall back to the `--config` file, then to the built-in
/// defaults.
#[derive(Args, Debug)]
struct CommonArgs {
    /// Kubernetes namespace where Che is deployed [default: che]
    #[arg(short = 'n', long = "chenamespace", env = "CHE_NAMESPACE")]
    namespace: Option<String>,

    /// Che server Deployment / DeploymentConfig name [default: che]
    #[arg(long, env = "CHE_DEPLOYMENT")]
    deployment_name: Option<String>,

    /// Label selector of the Che server pod
    #[arg(long)]
    che_selector: Option<String>,

    /// Che API access token, required when authentication is enabled
    #[arg(long, env = "CHE_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Kubeconfig file (defaults to $KUBECONFIG or the in-cluster config)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// YAML configuration file; flags override its values
    #[arg(long = "config")]
    config_file: Option<PathBuf>,

    /// Progress output
    #[arg(long = "listr-renderer", value_enum, default_value_t = RendererKind::Default)]
    renderer: RendererKind,

    /// Che server boot timeout in milliseconds [default: 40000]
    #[arg(short = 'o', long = "cheboottimeout")]
    boot_timeout: Option<u64>,

    /// Pod scheduling timeout in milliseconds [default: 300000]
    #[arg(long = "k8spodwaittimeout")]
    pod_wait_timeout: Option<u64>,

    /// Image download timeout in milliseconds [default: 600000]
    #[arg(long = "k8spoddownloadimagetimeout")]
    pod_download_timeout: Option<u64>,

    /// Pod readiness timeout in milliseconds [default: 130000]
    #[arg(long = "k8spodreadytimeout")]
    pod_ready_timeout: Option<u64>,
}

/// Flags of `server start`
#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Platform Che is deployed on [default: minikube]
    #[arg(short = 'p', long, value_enum)]
    platform: Option<Platform>,

    /// Installer to use (defaults per platform)
    #[arg(short = 'a', long, value_enum)]
    installer: Option<Installer>,

    /// Deploy in multi-user mode
    #[arg(short = 'm', long)]
    multiuser: bool,

    /// Enable OpenShift OAuth (OpenShift with the operator installer only)
    #[arg(long)]
    os_oauth: bool,

    /// Che server container image
    #[arg(short = 'i', long = "cheimage")]
    che_image: Option<String>,

    /// Directory holding the helm chart and operator templates
    #[arg(short = 't', long)]
    templates: Option<PathBuf>,

    /// Che operator container image
    #[arg(long = "che-operator-image")]
    operator_image: Option<String>,

    /// CheCluster resource applied by the operator installer
    #[arg(long = "che-operator-cr-yaml")]
    operator_cr_yaml: Option<PathBuf>,

    /// Cluster ingress domain
    #[arg(short = 'b', long)]
    domain: Option<String>,

    /// Enable TLS
    #[arg(short = 's', long)]
    tls: bool,

    /// Allow self-signed certificates
    #[arg(long)]
    self_signed_cert: bool,

    /// External plugin registry URL
    #[arg(long)]
    plugin_registry_url: Option<String>,

    /// External devfile registry URL
    #[arg(long)]
    devfile_registry_url: Option<String>,
}

impl CommonArgs {
    /// Config file (or defaults) with the flags that were given applied on top
    fn config(&self) -> anyhow::Result<OrchestratorConfig> {
        let mut config = match &self.config_file {
            Some(path) => OrchestratorConfig::from_yaml_file(path)?,
            None => OrchestratorConfig::default(),
        };
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(name) = &self.deployment_name {
            config.deployment_name = name.clone();
        }
        if self.che_selector.is_some() {
            config.che_selector = self.che_selector.clone();
        }
        if self.access_token.is_some() {
            config.access_token = self.access_token.clone();
        }
        let timeouts = &mut config.timeouts;
        for (flag, bound) in [
            (self.boot_timeout, &mut timeouts.server_boot),
            (self.pod_wait_timeout, &mut timeouts.pod_wait),
            (self.pod_download_timeout, &mut timeouts.pod_download),
            (self.pod_ready_timeout, &mut timeouts.pod_ready),
        ] {
            if let Some(ms) = flag {
                *bound = Duration::from_millis(ms);
            }
        }
        config.validate()?;
        Ok(config)
    }
}

impl StartArgs {
    fn config(&self) -> anyhow::Result<OrchestratorConfig> {
        let mut config = self.common.config()?;
        let install = &mut config.install;
        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if self.installer.is_some() {
            config.installer = self.installer;
        }
        config.multiuser |= self.multiuser;
        config.os_oauth |= self.os_oauth;
        if let Some(image) = &self.che_image {
            install.che_image = image.clone();
        }
        if let Some(templates) = &self.templates {
            install.templates = templates.clone();
        }
        if let Some(image) = &self.operator_image {
            install.operator_image = image.clone();
        }
        if self.operator_cr_yaml.is_some() {
            install.operator_cr_yaml = self.operator_cr_yaml.clone();
        }
        if self.domain.is_some() {
            install.domain = self.domain.clone();
        }
        install.tls |= self.tls;
        install.self_signed_cert |= self.self_signed_cert;
        if self.plugin_registry_url.is_some() {
            install.plugin_registry_url = self.plugin_registry_url.clone();
        }
        if self.devfile_registry_url.is_some() {
            install.devfile_registry_url = self.devfile_registry_url.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let Commands::Server(command) = cli.command;

    let common = match &command {
        ServerCommand::Start(args) => &args.common,
        ServerCommand::Stop(args) | ServerCommand::Delete(args) | ServerCommand::Status(args) => {
            args
        }
    };
    let orchestrator =
        Orchestrator::connect(common.kubeconfig.as_deref(), common.renderer.build()).await?;

    match &command {
        ServerCommand::Start(args) => {
            let config = args.config()?;
            let ctx = orchestrator.start_workflow(&config).await?;
            match ctx.app_url {
                Some(url) => println!("Che is running at {}", url),
                None => println!("Che is running"),
            }
        }
        ServerCommand::Stop(args) => {
            orchestrator.stop_workflow(&args.config()?).await?;
            println!("Che stopped");
        }
        ServerCommand::Delete(args) => {
            let config = args.config()?;
            orchestrator.delete_workflow(&config).await?;
            println!("Che deleted from namespace \"{}\"", config.namespace);
        }
        ServerCommand::Status(args) => {
            let report = orchestrator.status_check(&args.config()?).await?;
            print!("{}", report);
        }
    }
    Ok(())
}
