//! remotex - client for the remotex build service
//!
//! Keeps a local project tree (`src`, `aux`, `out`) in sync with its copy
//! on a remotex server and runs builds remotely.
//!
//! ## Commands
//!
//! - `init`: create a local project skeleton and its `.remotex` file
//! - `push` / `pull`: reconcile one subdir in either direction
//! - `build`: push sources, build, pull results
//! - `clone`: materialize a remote project locally
//! - `files`: list local or remote files
//! - `project`: show the project settings

mod project_config;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use remotex_core::{
    build_and_sync, clone_into, pull, push, scan_manifest, BuildOptions, Engine, HttpRemote,
    HttpRemoteConfig, RemoteEndpoint, RemotexError, SyncReport,
};
use remotex_state::{FileRecord, Subdir};
use tracing::Level;

use project_config::{find_project_root, ProjectConfig};

#[derive(Parser)]
#[command(name = "remotex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Remote LaTeX builds with content-addressed sync", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    remote: RemoteArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct RemoteArgs {
    /// Server base URL
    #[arg(long, global = true, env = "REMOTEX_SERVER")]
    server: Option<String>,

    /// Remote user owning the project
    #[arg(long, global = true, env = "REMOTEX_USER")]
    user: Option<String>,

    /// Bearer token
    #[arg(long, global = true, env = "REMOTEX_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl RemoteArgs {
    fn connect(&self, project: &str) -> Result<HttpRemote> {
        let Some(server) = self.server.clone() else {
            bail!("no server configured (--server or REMOTEX_SERVER)");
        };
        let Some(user) = self.user.clone() else {
            bail!("no user configured (--user or REMOTEX_USER)");
        };
        let remote = HttpRemote::new(HttpRemoteConfig {
            server,
            user,
            project: project.to_string(),
            token: self.token.clone(),
        })?;
        Ok(remote)
    }
}

#[derive(Args, Debug, Default)]
struct BuildArgs {
    /// pdf, lua or xe (default: project setting)
    #[arg(short, long)]
    engine: Option<Engine>,

    /// Continue past errors
    #[arg(short, long)]
    force: bool,

    #[arg(long)]
    file_line_error: bool,

    /// Main document, relative to src
    #[arg(short, long)]
    document: Option<String>,

    #[arg(long)]
    dependents: bool,

    /// Empty aux and out on the server first
    #[arg(long)]
    clean: bool,

    /// Also pull aux after the build
    #[arg(long)]
    save_aux: bool,
}

impl BuildArgs {
    /// Project defaults with command-line overrides applied.
    fn apply(&self, defaults: &BuildOptions) -> BuildOptions {
        BuildOptions {
            engine: self.engine.unwrap_or(defaults.engine),
            force: self.force || defaults.force,
            file_line_error: self.file_line_error || defaults.file_line_error,
            document: self.document.clone().or_else(|| defaults.document.clone()),
            dependents: self.dependents || defaults.dependents,
            clean_build: self.clean || defaults.clean_build,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a local project skeleton
    Init {
        /// Project name on the server
        name: String,

        /// Directory to create (default: the project name)
        path: Option<PathBuf>,
    },

    /// Make the remote subdir match the local one
    Push {
        #[arg(default_value = "src")]
        subdir: Subdir,
    },

    /// Make local subdirs match the remote ones (default: out, plus aux when
    /// the project saves aux files)
    Pull { subdir: Option<Subdir> },

    /// Push sources, build remotely, pull results
    Build(BuildArgs),

    /// Copy a remote project into a new directory
    Clone {
        name: String,

        /// Directory to create (default: the project name)
        path: Option<PathBuf>,

        /// Also pull aux
        #[arg(long)]
        save_aux: bool,
    },

    /// List project files
    Files {
        /// List the server's index instead of the local tree
        #[arg(long)]
        remote: bool,
    },

    /// Show the project settings
    Project,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    remotex_core::telemetry::init_tracing(cli.json, level);

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    match cli.command {
        Commands::Init { name, path } => cmd_init(&cwd, &name, path),
        Commands::Push { subdir } => cmd_push(&cli.remote, &cwd, subdir).await,
        Commands::Pull { subdir } => cmd_pull(&cli.remote, &cwd, subdir).await,
        Commands::Build(args) => cmd_build(&cli.remote, &cwd, &args).await,
        Commands::Clone {
            name,
            path,
            save_aux,
        } => cmd_clone(&cli.remote, &cwd, &name, path, save_aux).await,
        Commands::Files { remote } => cmd_files(&cli.remote, &cwd, remote).await,
        Commands::Project => cmd_project(&cwd),
    }
}

fn open_project(cwd: &Path) -> Result<(PathBuf, ProjectConfig)> {
    let root = find_project_root(cwd)?;
    let config = ProjectConfig::read(&root)?;
    Ok((root, config))
}

fn print_report(report: &SyncReport, verb: &str) {
    let diff = &report.diff;
    println!(
        "{}: {} {verb}, {} removed, {} unchanged",
        report.subdir,
        diff.added.len(),
        diff.removed.len(),
        diff.same.len()
    );
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.path, skipped.reason);
    }
}

fn cmd_init(cwd: &Path, name: &str, path: Option<PathBuf>) -> Result<()> {
    remotex_core::validate_name(name)?;
    if let Ok(root) = find_project_root(cwd) {
        bail!("Already in a project: {}", root.display());
    }
    let root = cwd.join(path.unwrap_or_else(|| PathBuf::from(name)));
    if root.exists() {
        bail!("{} already exists", root.display());
    }
    for subdir in Subdir::ALL {
        std::fs::create_dir_all(root.join(subdir.as_str()))
            .with_context(|| format!("Failed to create {}", root.display()))?;
    }
    ProjectConfig::new(name).write(&root)?;
    println!("Initialized project '{}' at {}", name, root.display());
    Ok(())
}

async fn cmd_push(remote: &RemoteArgs, cwd: &Path, subdir: Subdir) -> Result<()> {
    let (root, config) = open_project(cwd)?;
    let endpoint = remote.connect(&config.project_name)?;
    let report = push(&root, subdir, &endpoint).await?;
    print_report(&report, "uploaded");
    Ok(())
}

async fn cmd_pull(remote: &RemoteArgs, cwd: &Path, subdir: Option<Subdir>) -> Result<()> {
    let (root, config) = open_project(cwd)?;
    let endpoint = remote.connect(&config.project_name)?;
    let subdirs = match subdir {
        Some(subdir) => vec![subdir],
        None if config.save_aux_files => vec![Subdir::Out, Subdir::Aux],
        None => vec![Subdir::Out],
    };
    for subdir in subdirs {
        let report = pull(&root, subdir, &endpoint).await?;
        print_report(&report, "downloaded");
    }
    Ok(())
}

/// The driver's exit status as ours. Statuses the OS would truncate to
/// success become 1.
fn process_status(exit_code: i32) -> i32 {
    if (1..=255).contains(&exit_code) {
        exit_code
    } else {
        1
    }
}

async fn cmd_build(remote: &RemoteArgs, cwd: &Path, args: &BuildArgs) -> Result<()> {
    let (root, config) = open_project(cwd)?;
    let endpoint = remote.connect(&config.project_name)?;
    let options = args.apply(&config.build_options);
    let save_aux = args.save_aux || config.save_aux_files;

    match build_and_sync(&root, &endpoint, &options, save_aux).await {
        Ok(report) => {
            print_report(&report.pushed, "uploaded");
            print!("{}", report.output);
            for pulled in &report.pulled {
                print_report(pulled, "downloaded");
            }
            Ok(())
        }
        Err(RemotexError::Driver { exit_code, output }) => {
            print!("{output}");
            eprintln!("Build failed with exit code {exit_code}");
            std::process::exit(process_status(exit_code));
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_clone(
    remote: &RemoteArgs,
    cwd: &Path,
    name: &str,
    path: Option<PathBuf>,
    save_aux: bool,
) -> Result<()> {
    remotex_core::validate_name(name)?;
    let root = cwd.join(path.unwrap_or_else(|| PathBuf::from(name)));
    let endpoint = remote.connect(name)?;
    let reports = clone_into(&root, &endpoint, save_aux).await?;

    let config = ProjectConfig {
        save_aux_files: save_aux,
        ..ProjectConfig::new(name)
    };
    config.write(&root)?;
    for report in &reports {
        print_report(report, "downloaded");
    }
    println!("Cloned '{}' into {}", name, root.display());
    Ok(())
}

fn print_files(subdir: Subdir, files: &[FileRecord]) {
    println!("{subdir}:");
    for file in files {
        println!("  {}  {:>10}  {}", file.digest.short(), file.size, file.path);
    }
}

async fn cmd_files(remote: &RemoteArgs, cwd: &Path, from_remote: bool) -> Result<()> {
    let (root, config) = open_project(cwd)?;
    if from_remote {
        let endpoint = remote.connect(&config.project_name)?;
        for subdir in Subdir::ALL {
            print_files(subdir, &endpoint.list_files(subdir).await?);
        }
        return Ok(());
    }
    for subdir in Subdir::ALL {
        let dir = root.join(subdir.as_str());
        let report = tokio::task::spawn_blocking(move || scan_manifest(&dir)).await??;
        print_files(subdir, &report.manifest);
    }
    Ok(())
}

fn cmd_project(cwd: &Path) -> Result<()> {
    let (root, config) = open_project(cwd)?;
    println!("root          {}", root.display());
    println!("projectName   {}", config.project_name);
    println!("saveAuxFiles  {}", config.save_aux_files);
    println!(
        "buildOptions  {}",
        serde_json::to_string(&config.build_options)?
    );
    Ok(())
}
