use anyhow::Context;
use clap::{Parser, Subcommand};
use kubeship::docker_cli::DockerCli;
use kubeship::environment::{Definition, TagSources};
use kubeship::oci_registry::{self, RegistryTags};
use kubeship::{commands, config, rollout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the deployment config file
    #[arg(short, long, env = "KUBESHIP_CONFIG", default_value = "kubeship.yaml")]
    config: PathBuf,

    /// Environment to operate on
    #[arg(short, long, env = "KUBESHIP_ENV", default_value = "development")]
    environment: String,

    /// Seconds a single docker invocation may run before it is killed
    #[arg(long, default_value_t = 3600)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current, previous and next version of every image
    Versions,
    /// Build images under their next version's tags
    Build {
        /// Build argument passed to docker, overrides the config file
        #[arg(long = "build-arg", value_parser = parse_key_val)]
        build_args: Vec<(String, String)>,
        /// Only build the named image (app, assets)
        #[arg(long)]
        image: Option<String>,
    },
    /// Push every tag of the images' current versions
    Push {
        /// Only push the named image (app, assets)
        #[arg(long)]
        image: Option<String>,
    },
    /// Point the environment's Kubernetes workload at the current versions
    Rollout,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{}`", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kubeship {}", env!("CARGO_PKG_VERSION"));
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running docker commands");
            on_signal.cancel();
        }
    });

    let config = config::load_config(&cli.config)?;
    let http_client = oci_registry::create_client(&config.tls.ca_certificate_paths)?;
    let docker = Arc::new(DockerCli::new(Duration::from_secs(cli.timeout), cancel));
    let definition = Definition::new(
        config,
        TagSources {
            local: docker.clone(),
            registry: Arc::new(RegistryTags::new(http_client)),
        },
    );
    let environment = definition.environment(&cli.environment)?;

    match cli.command {
        Command::Versions => {
            for line in commands::versions(&environment).await {
                println!("{}", line);
            }
        }
        Command::Build { build_args, image } => {
            let mut args = environment.docker().build_args().clone();
            args.extend(build_args);
            let images = commands::selected_images(&environment, image.as_deref())?;
            commands::build(&images, docker.as_ref(), &args).await?;
        }
        Command::Push { image } => {
            let images = commands::selected_images(&environment, image.as_deref())?;
            commands::push(&images, docker.as_ref()).await?;
        }
        Command::Rollout => {
            let client = rollout::create_client().await?;
            rollout::run(client, &environment)
                .await
                .with_context(|| format!("Failed to roll out environment {}", environment.name()))?;
        }
    }

    Ok(())
}
