//! `codevec`: index a code base into a vector store and query it.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use codevec_chunker::TreeSitterChunker;
use codevec_pipeline::{
    Indexer, PipelineError, QueryInclude, SpecFiles, expand_paths, query, render_text,
    resolve_reranker,
};
use codevec_store::{
    BackendRegistry, ClientRegistry, ResultType, StoreConnector, StoreError, VectoriseStats,
    cleanup, count,
};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, find_project_root, global_dir};

#[derive(Parser)]
#[command(name = "codevec", version, about = "Index source code into a vector store and query it")]
struct Cli {
    /// Project root; discovered from the working directory when omitted.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Extra config file applied after the global and project files.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable JSON on stdout.
    #[arg(long, global = true)]
    pipe: bool,

    /// Log progress to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and store files.
    Vectorise {
        /// Files, directories or glob patterns. Defaults to the include spec,
        /// or the whole project.
        paths: Vec<String>,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long)]
        include_hidden: bool,
        /// Re-vectorise files even when their content is unchanged.
        #[arg(short, long)]
        force: bool,
    },
    /// Search the project's collection.
    Query {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(short = 'n', long)]
        number: Option<usize>,
        /// Fields to output: path, document, chunk.
        #[arg(long, num_args = 1.., value_parser = parse_include)]
        include: Option<Vec<QueryInclude>>,
        /// Print absolute paths.
        #[arg(long)]
        absolute: bool,
        /// Candidate pool multiplier in document mode.
        #[arg(long)]
        multiplier: Option<i32>,
        /// Files excluded from the results.
        #[arg(long, num_args = 1..)]
        exclude: Vec<PathBuf>,
    },
    /// Re-vectorise indexed files that changed and remove deleted ones.
    Update,
    /// List collections owned by the current user on this host.
    Ls,
    /// Inspect or remove indexed files.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },
    /// Drop the project's collection.
    Drop,
    /// Drop every empty collection.
    Clean,
    /// Print the chunks of files without touching the store.
    Chunks { files: Vec<PathBuf> },
}

#[derive(Subcommand)]
enum FilesAction {
    Ls,
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn parse_include(s: &str) -> Result<QueryInclude, String> {
    s.parse().map_err(|e: PipelineError| e.to_string())
}

fn init_subscriber(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit status for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        let store = cause
            .downcast_ref::<StoreError>()
            .or_else(|| match cause.downcast_ref::<PipelineError>() {
                Some(PipelineError::Store(e)) => Some(e),
                _ => None,
            });
        match store {
            Some(StoreError::CollectionNotFound { .. }) => return 2,
            Some(StoreError::MetadataMismatch { .. }) => return 3,
            Some(StoreError::ServerTimeout { .. }) => return 4,
            _ => {}
        }
        if matches!(cause.downcast_ref::<PipelineError>(), Some(PipelineError::Cancelled)) {
            return 5;
        }
    }
    1
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("cannot read working directory")?;
    let project_root = match &cli.project_root {
        Some(root) => std::path::absolute(root)?,
        None => find_project_root(&cwd),
    };
    let mut layers = Config::layers(&project_root);
    layers.extend(cli.config.clone());
    let config = Config::load(&layers)?;
    config.validate()?;
    tracing::debug!(root = %project_root.display(), backend = %config.backend, "configuration loaded");

    if let Command::Chunks { files } = &cli.command {
        return print_chunks(&config, files, cli.pipe);
    }

    let backends = BackendRegistry::default();
    backends.resolve(&config.backend)?;
    let clients = Arc::new(ClientRegistry::new());
    let result = async {
        let connector: Arc<dyn StoreConnector> = Arc::from(
            backends
                .connect(&config.backend, config.store_config(&project_root), Arc::clone(&clients))
                .await?,
        );
        dispatch(&cli, &config, &project_root, connector).await
    }
    .await;
    clients.shutdown().await;
    result
}

async fn dispatch(
    cli: &Cli,
    config: &Config,
    project_root: &Path,
    connector: Arc<dyn StoreConnector>,
) -> anyhow::Result<()> {
    match &cli.command {
        Command::Vectorise {
            paths,
            recursive,
            include_hidden,
            force,
        } => {
            let specs = SpecFiles::load(
                project_root,
                global_dir().as_deref(),
                *recursive || paths.is_empty(),
            )?;
            let files = if paths.is_empty() {
                match &specs.include {
                    Some(_) => specs.included_files(project_root),
                    None => expand_paths(&[".".to_owned()], project_root, true, *include_hidden)?,
                }
            } else {
                let cwd = std::env::current_dir()?;
                expand_paths(paths, &cwd, *recursive, *include_hidden)?
            };
            let files = specs.filter_excluded(files);
            let indexer = Indexer::new(connector).with_cancellation(cancel_on_ctrl_c());
            print_stats(&indexer.index(files, *force).await?, cli.pipe);
        }
        Command::Update => {
            let indexer = Indexer::new(connector).with_cancellation(cancel_on_ctrl_c());
            print_stats(&indexer.update().await?, cli.pipe);
        }
        Command::Query {
            query: queries,
            number,
            include,
            absolute,
            multiplier,
            exclude,
        } => {
            let mut query_config = config.query_config(project_root, queries.clone());
            if let Some(n) = number {
                query_config.n_result = *n;
            }
            if let Some(include) = include {
                query_config.include.clone_from(include);
            }
            if let Some(m) = multiplier {
                query_config.query_multiplier = *m;
            }
            query_config.use_absolute_path |= *absolute;
            query_config.exclude.clone_from(exclude);

            let reranker = resolve_reranker(&config.reranker, &config.reranker_params)?;
            let outputs = query(connector.as_ref(), reranker.as_ref(), &query_config).await?;
            if cli.pipe {
                println!("{}", serde_json::to_string(&outputs)?);
            } else {
                print!("{}", render_text(&outputs, &query_config.include));
            }
        }
        Command::Ls => {
            let collections = connector.list_collections().await?;
            if cli.pipe {
                println!("{}", serde_json::to_string(&collections)?);
            } else {
                for c in collections {
                    println!(
                        "{}\t{} files\t{} chunks\t{}",
                        c.path, c.file_count, c.chunk_count, c.embedding_function
                    );
                }
            }
        }
        Command::Files { action } => files_command(action, connector.as_ref(), cli.pipe).await?,
        Command::Drop => {
            connector.drop_collection(None).await?;
            if !cli.pipe {
                println!("Dropped collection for {}", project_root.display());
            }
        }
        Command::Clean => {
            let removed = cleanup(connector.as_ref()).await?;
            if cli.pipe {
                println!("{}", serde_json::to_string(&removed)?);
            } else {
                for path in removed {
                    println!("Removed {path}");
                }
            }
        }
        Command::Chunks { files } => print_chunks(config, files, cli.pipe)?,
    }
    Ok(())
}

async fn files_command(
    action: &FilesAction,
    connector: &dyn StoreConnector,
    pipe: bool,
) -> anyhow::Result<()> {
    match action {
        FilesAction::Ls => {
            let content = connector
                .list_collection_content(Some(ResultType::Document))
                .await?;
            let paths: Vec<String> = content.files.into_iter().map(|f| f.path).collect();
            if pipe {
                println!("{}", serde_json::to_string(&paths)?);
            } else {
                for path in paths {
                    println!("{path}");
                }
            }
        }
        FilesAction::Rm { paths } => {
            let targets: Vec<String> = paths
                .iter()
                .map(|p| std::path::absolute(p).map(|p| p.to_string_lossy().into_owned()))
                .collect::<std::io::Result<_>>()?;
            let removed = connector.delete(&targets).await?;
            if count(connector, ResultType::Document).await? == 0 {
                tracing::info!("collection is empty, dropping it");
                connector.drop_collection(None).await?;
            }
            if !pipe {
                println!("Removed {removed} file(s)");
            }
        }
    }
    Ok(())
}

fn print_chunks(config: &Config, files: &[PathBuf], pipe: bool) -> anyhow::Result<()> {
    let chunker = TreeSitterChunker::new(config.chunker())?;
    let mut all = Vec::new();
    for file in files {
        all.extend(chunker.chunk_file(file)?);
    }
    if pipe {
        println!("{}", serde_json::to_string(&all)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&all)?);
    }
    Ok(())
}

fn print_stats(stats: &VectoriseStats, pipe: bool) {
    if pipe {
        println!("{}", stats.to_json());
    } else {
        print!("{}", stats.to_table());
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}
