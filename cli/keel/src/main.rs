//! Keel CLI — dependency resolution for the Keel language.

mod commands;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "keel", version, about = "Module resolver for the Keel language")]
struct Cli {
    /// Ordered mirror list. Entries separated by ',' fall back to the next
    /// mirror only on not-found; entries separated by '|' fall back on any
    /// error. Defaults to $KEEL_MIRRORS.
    #[arg(long, global = true)]
    mirrors: Option<String>,
    /// Content cache directory (default: ~/.keel/cache)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Main module directory (default: current directory)
    #[arg(long, global = true)]
    module_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve packages and print one record per package
    List {
        /// Package patterns: "all", "prefix/...", or literal import paths
        patterns: Vec<String>,
        /// Emit JSON records, one per line
        #[arg(long)]
        json: bool,
        /// Also load test dependencies of the root packages
        #[arg(long)]
        tests: bool,
        /// Record package errors in the output instead of failing on the
        /// first one
        #[arg(short = 'e', long)]
        tolerate_errors: bool,
    },
    /// Print the module requirement graph
    Graph {
        /// Print the selected build list instead of the edges
        #[arg(long)]
        build_list: bool,
    },
    /// Explain why a package is in the import graph
    Why {
        /// Import path of the package
        package: String,
    },
    /// List known versions of a module
    Versions {
        /// Module path
        module: String,
        /// Only versions beginning with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Download a module version into the cache and record its hashes
    Fetch {
        /// module@version
        spec: String,
        /// Archive size limit in bytes
        #[arg(long, default_value_t = 512 * 1024 * 1024)]
        size_limit: u64,
    },
    /// Report requirement conflicts without re-resolving the whole graph
    Check,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keel=warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let env = commands::Env::new(cli.mirrors, cli.cache_dir, cli.module_root)?;
    match cli.command {
        Commands::List {
            patterns,
            json,
            tests,
            tolerate_errors,
        } => commands::list::run(&env, &cancel, &patterns, json, tests, tolerate_errors).await,
        Commands::Graph { build_list } => commands::graph::run(&env, &cancel, build_list).await,
        Commands::Why { package } => commands::why::run(&env, &cancel, &package).await,
        Commands::Versions { module, prefix } => {
            commands::versions::run(&env, &cancel, &module, &prefix).await
        }
        Commands::Fetch { spec, size_limit } => {
            commands::fetch::run(&env, &cancel, &spec, size_limit).await
        }
        Commands::Check => commands::check::run(&env, &cancel).await,
    }
}
