//! callgate - operator tool for filter blobs, sandboxed listings and
//! authorization checks.
//!
//! Roots, isolation and blob limits come from the same configuration the
//! server uses (`CALLGATE_CONFIG` plus `CALLGATE_*` overrides).

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use callgate::codec::{self, FilterSpec, PredicateRegistry};
use callgate::{
    CallAuthorizer, ClassDescriptor, CodeOrigin, ConfiguredRoots, GateConfig, GateError, Interface,
};

#[derive(Parser, Debug)]
#[command(name = "callgate", version, about = "Remote call gate utilities")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a JSON filter description into a transport blob
    Encode {
        /// Filter as JSON, e.g. '{"kind":"suffix","suffix":".txt"}'
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// Read the filter JSON from a file
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },

    /// Decode a transport blob and print the filter it carries
    Decode {
        #[arg(long)]
        blob: String,
    },

    /// List a directory through a filter blob under the sandbox
    List {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, env = "USER", default_value = "operator")]
        user: String,
    },

    /// Check whether a class would be remotely callable
    Authorize {
        #[arg(long)]
        class: String,
        /// Archive or class file the code was loaded from; omit for built-in code
        #[arg(long, value_name = "PATH")]
        origin: Option<PathBuf>,
        #[arg(long, value_enum)]
        marker: Vec<Marker>,
        #[arg(long, env = "USER", default_value = "operator")]
        user: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Marker {
    RequiresAuth,
    NoAuthRequired,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Encode { json, file } => {
            let raw = match (json, file) {
                (Some(json), _) => json,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read filter file {}", path.display()))?,
                (None, None) => return Err(anyhow!("one of --json or --file is required")),
            };
            let spec: FilterSpec = serde_json::from_str(&raw).context("invalid filter JSON")?;
            println!("{}", codec::encode_filter(&spec)?);
        }

        Command::Decode { blob } => {
            let cfg = GateConfig::load()?;
            let spec = codec::decode_filter(&blob, cfg.max_blob_bytes).map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&spec)?);
        }

        Command::List { dir, filter, user } => {
            let cfg = GateConfig::load()?;
            let gate = callgate::CallGate::from_config(
                &cfg,
                Arc::new(callgate::ClassRegistry::new()),
                PredicateRegistry::new(),
            );
            let names = gate
                .list(&user, &dir, filter.as_deref())
                .map_err(report)?;
            for name in names {
                println!("{name}");
            }
        }

        Command::Authorize {
            class,
            origin,
            marker,
            user,
        } => {
            let cfg = GateConfig::load()?;
            let origin = match origin {
                Some(path) if path.extension().is_some_and(|ext| ext == "class") => {
                    CodeOrigin::ClassFile(path)
                }
                Some(path) => CodeOrigin::Archive(path),
                None => CodeOrigin::Builtin,
            };
            let descriptor = marker.iter().fold(
                ClassDescriptor::new(&class)?.loaded_from(origin),
                |d, m| {
                    d.implementing(match m {
                        Marker::RequiresAuth => Interface::RequiresAuth,
                        Marker::NoAuthRequired => Interface::NoAuthRequired,
                    })
                },
            );
            let authorizer = CallAuthorizer::new(Arc::new(ConfiguredRoots::from_config(&cfg)));
            match authorizer.check_callable(&descriptor, &user) {
                Ok(()) => println!("{class}: callable by {user}"),
                Err(err) => return Err(report(err)),
            }
        }
    }
    Ok(())
}

fn report(err: GateError) -> anyhow::Error {
    let status = err.client_status();
    anyhow!("{} ({:?}, {})", err.client_message(), status, status.http_code())
}
