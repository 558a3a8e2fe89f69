use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use coh_core::Coherence;
use kube::CustomResourceExt;
use tracing::info;

mod config;
mod render;
mod run;

use config::OperatorConfig;

#[derive(Parser, Debug)]
#[command(name = "coh-operator", version, about = "Coherence cluster operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// YAML file overriding built-in catalog values (ports, labels, names)
    #[arg(long = "catalog", env = "COH_CATALOG", global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Coherence resources and reconcile them
    Run(OperatorConfig),
    /// Synthesize the resources for a Coherence spec file
    Render {
        /// Coherence manifest or bare spec (YAML)
        file: PathBuf,
        /// Deployment identity, "namespace/name" or "name"
        #[arg(long = "id")]
        id: Option<String>,
        /// Print the resource set as stored (input for `diff --previous`)
        #[arg(long = "set", action = ArgAction::SetTrue)]
        set: bool,
    },
    /// Show what applying a spec file would change
    Diff {
        file: PathBuf,
        #[arg(long = "id")]
        id: Option<String>,
        /// Previously rendered set (`render --set`); empty when omitted
        #[arg(long = "previous")]
        previous: Option<PathBuf>,
    },
    /// Print the Coherence CustomResourceDefinition
    Crd,
}

fn init_tracing() {
    let env = std::env::var("COH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid COH_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_docs<T: serde::Serialize>(output: Output, docs: &[T]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(docs)?),
        _ => {
            for d in docs {
                println!("---");
                print!("{}", serde_yaml::to_string(d)?);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let catalog = config::load_catalog(cli.catalog.as_deref())?;

    match cli.command {
        Commands::Run(cfg) => {
            init_metrics(cfg.metrics_addr.as_deref());
            run::run(cfg, catalog).await?;
        }
        Commands::Render { file, id, set } => {
            let (id, spec) = render::load_spec(&file, id.as_deref())?;
            info!(deployment = %id, file = %file.display(), "render invoked");
            let resources = render::synthesize(&spec, &id, &catalog)?;
            if set {
                match cli.output {
                    Output::Yaml => print!("{}", serde_yaml::to_string(&resources)?),
                    _ => println!("{}", serde_json::to_string_pretty(&resources)?),
                }
            } else if cli.output == Output::Human {
                println!("{:<22} {:<32} HASH", "KIND", "NAME");
                for r in resources.iter() {
                    let hash = r.hash.map(|h| format!("{h:016x}")).unwrap_or_else(|| "-".to_string());
                    println!("{:<22} {:<32} {}", r.kind().as_str(), r.name(), hash);
                }
            } else {
                print_docs(cli.output, &render::manifests(&id, &resources)?)?;
            }
        }
        Commands::Diff { file, id, previous } => {
            let (id, spec) = render::load_spec(&file, id.as_deref())?;
            let current = render::synthesize(&spec, &id, &catalog)?;
            let previous = match previous {
                Some(p) => render::load_set(&p)?,
                None => coh_core::ResourceSet::empty(),
            };
            let lines = render::diff_lines(&id, &previous, &current)?;
            info!(deployment = %id, changes = lines.len(), "diff invoked");
            match cli.output {
                Output::Human => {
                    if lines.is_empty() {
                        println!("no changes");
                    }
                    for l in &lines {
                        println!("{}", l.render());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&lines)?),
            }
        }
        Commands::Crd => {
            let crd = Coherence::crd();
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
                _ => print!("{}", serde_yaml::to_string(&crd)?),
            }
        }
    }

    Ok(())
}
