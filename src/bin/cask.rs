//! cask - minimal OCI container engine CLI
//!
//! ## Usage
//!
//! ```sh
//! cask run [-i] [-t] [-d] [--rm] [-m 512m] [--name web] alpine [CMD...]
//! cask ps
//! cask stop web
//! cask rm web
//! cask image pull alpine:3.20
//! cask image ls
//! cask image tag alpine:3.20 mirror.local/alpine:stable
//! cask image save -o alpine.tar alpine:3.20
//! cask image load -i alpine.tar
//! ```
//!
//! Every container command is also available under `cask container ...`.
//!
//! ## Stage 2
//!
//! `cask inner-container-run <sandbox> <launch-file>` is the entry point of
//! the re-executed child. It is dispatched before argument parsing and is
//! not meant to be invoked by hand.

use anyhow::{Context, bail};
use cask::archive;
use cask::child;
use cask::constants::REEXEC_COMMAND;
use cask::{
    ContainerMeta, Engine, EngineConfig, ImageReference, ImageSummary, Role, RunOptions,
    Termination, parse_byte_quantity,
};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "cask", version, about = "Minimal OCI container engine")]
struct Cli {
    /// Directory holding the engine state (default: $CASK_ROOT or the
    /// current directory)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(flatten)]
    Direct(ContainerCommand),

    /// Container commands
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },

    /// Image commands
    #[command(visible_aliases = ["images", "img"])]
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ContainerCommand {
    /// Start and run a container
    Run(RunArgs),

    /// List containers
    #[command(visible_aliases = ["list", "ls"])]
    Ps,

    /// Stop containers
    Stop {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Remove containers
    #[command(visible_alias = "rm")]
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Keep STDIN open even if not attached
    #[arg(short, long)]
    interactive: bool,

    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    tty: bool,

    /// Run container in background and print container ID
    #[arg(short, long)]
    detach: bool,

    /// Automatically remove the container when it exits
    #[arg(long)]
    rm: bool,

    /// Memory limit (e.g. 512m, 1GiB)
    #[arg(short, long, value_parser = parse_memory)]
    memory: Option<u64>,

    /// Assign a name to the container
    #[arg(long)]
    name: Option<String>,

    image: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ImageCommand {
    /// List images
    #[command(visible_alias = "ls")]
    List,

    /// Pull an image from a registry
    Pull { reference: String },

    /// Remove images
    #[command(visible_alias = "rm")]
    Remove {
        #[arg(required = true)]
        references: Vec<String>,
    },

    /// Create a tag TARGET that refers to SOURCE
    Tag { source: String, target: String },

    /// Load an image from a tar archive
    Load {
        /// Read from tar archive file
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Name to index the image under
        #[arg(long)]
        tag: Option<String>,
    },

    /// Save images to a tar archive (streamed to STDOUT by default)
    Save {
        /// Write to a file instead of STDOUT
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[arg(required = true)]
        references: Vec<String>,
    },
}

fn parse_memory(value: &str) -> Result<u64, String> {
    parse_byte_quantity(value).map_err(|e| e.to_string())
}

// =============================================================================
// Entry Point
// =============================================================================

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    if args.get(1).is_some_and(|a| a == REEXEC_COMMAND) {
        init_logging();
        return stage_two(&args[2..]);
    }

    let cli = Cli::parse();
    init_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn stage_two(args: &[OsString]) -> ExitCode {
    let [sandbox, launch_file] = args else {
        println!("usage: cask {REEXEC_COMMAND} <sandbox> <launch-file>");
        return ExitCode::FAILURE;
    };
    match child::run_in_sandbox(Role::Sandbox, Path::new(sandbox), Path::new(launch_file)) {
        Ok(never) => match never {},
        Err(e) => {
            println!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::from_env(cli.root).context("resolving configuration")?;
    let engine = Engine::new(config).context("opening engine state")?;

    match cli.command {
        Commands::Direct(command) | Commands::Container { command } => {
            container_command(&engine, command).await
        }
        Commands::Image { command } => image_command(&engine, command).await,
    }
}

// =============================================================================
// Container Commands
// =============================================================================

async fn container_command(engine: &Engine, command: ContainerCommand) -> anyhow::Result<()> {
    match command {
        ContainerCommand::Run(args) => cmd_run(engine, args).await,
        ContainerCommand::Ps => cmd_ps(engine),
        ContainerCommand::Stop { names } => cmd_stop(engine, &names).await,
        ContainerCommand::Remove { names } => cmd_remove(engine, &names),
    }
}

async fn cmd_run(engine: &Engine, args: RunArgs) -> anyhow::Result<()> {
    let options = RunOptions {
        image: args.image,
        args: args.command,
        name: args.name,
        interactive: args.interactive,
        tty: args.tty,
        detach: args.detach,
        remove: args.rm,
        memory: args.memory,
    };

    let running = engine.start(options, Role::Orchestrator).await?;
    if args.detach {
        println!("{}", running.id());
    }
    let outcome = running.wait().await?;
    info!(
        container = %outcome.container_id,
        name = %outcome.name,
        exit_code = outcome.exit_code,
        "run finished"
    );
    Ok(())
}

fn cmd_ps(engine: &Engine) -> anyhow::Result<()> {
    let containers = engine.list_containers()?;
    let mut out = io::stdout().lock();
    writeln!(
        out,
        "CONTAINER ID\tIMAGE\tCOMMAND\tCREATED\tSTATUS\tPORTS\tNAMES"
    )?;
    for container in &containers {
        writeln!(out, "{}", container_row(container))?;
    }
    Ok(())
}

fn container_row(c: &ContainerMeta) -> String {
    let created = c
        .created
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S");
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        c.container_id, c.image, c.command, created, c.status, c.ports, c.name
    )
}

async fn cmd_stop(engine: &Engine, names: &[String]) -> anyhow::Result<()> {
    let report = engine.stop(names).await?;
    for name in &report.not_found {
        println!("No such container: {name}");
    }
    for (name, termination) in &report.stopped {
        match termination {
            Termination::Graceful => println!("{name}"),
            Termination::Forced => println!("{name} (killed)"),
        }
    }
    if let Some((name, e)) = report.failed.first() {
        bail!("failed to stop {name}: {e}");
    }
    Ok(())
}

fn cmd_remove(engine: &Engine, names: &[String]) -> anyhow::Result<()> {
    let report = engine.remove(names)?;
    for name in &report.removed {
        println!("{name}");
    }
    if let Some(notice) = &report.notice {
        println!("{notice}");
    }
    Ok(())
}

// =============================================================================
// Image Commands
// =============================================================================

async fn image_command(engine: &Engine, command: ImageCommand) -> anyhow::Result<()> {
    let store = engine.images();
    match command {
        ImageCommand::List => {
            let rows = store.list()?;
            let mut out = io::stdout().lock();
            writeln!(out, "REPOSITORY\tTAG\tIMAGE ID\tSIZE")?;
            for row in &rows {
                writeln!(out, "{}", image_row(row))?;
            }
        }
        ImageCommand::Pull { reference } => {
            let reference = ImageReference::parse(&reference)?;
            let image = engine.pull(&reference).await?;
            println!("{}: {}", reference.canonical(), image.digest);
        }
        ImageCommand::Remove { references } => {
            for reference in &references {
                let reference = ImageReference::parse(reference)?;
                store.remove(&reference)?;
                println!("Untagged: {}", reference.canonical());
            }
        }
        ImageCommand::Tag { source, target } => {
            let source = ImageReference::parse(&source)?;
            let target = ImageReference::parse(&target)?;
            store.tag(&source, &target)?;
        }
        ImageCommand::Load { input, tag } => {
            let tag = tag.as_deref().map(ImageReference::parse).transpose()?;
            let (name, _) =
                archive::import(store, &input, tag.as_ref(), &engine.config().temp_dir())
                    .with_context(|| format!("loading {}", input.display()))?;
            println!("Loaded image: {name}");
        }
        ImageCommand::Save { output, references } => {
            let references = references
                .iter()
                .map(|r| ImageReference::parse(r))
                .collect::<cask::Result<Vec<_>>>()?;
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    archive::export(store, &references, BufWriter::new(file))?;
                }
                None => archive::export(store, &references, BufWriter::new(io::stdout().lock()))?,
            }
        }
    }
    Ok(())
}

fn image_row(row: &ImageSummary) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        row.repository,
        row.tag,
        row.image_id,
        human_size(row.size)
    )
}

/// SI-formatted size, e.g. `7.8 MB`.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes < 10 {
        return format!("{bytes} B");
    }
    let exponent = ((bytes as f64).log10() / 3.0).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / 1000f64.powi(exponent as i32);
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[exponent])
    } else {
        format!("{value:.0} {}", UNITS[exponent])
    }
}
