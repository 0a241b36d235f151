//! remotexd - remotex build service
//!
//! Administers users and projects on the server side and runs builds
//! against them, natively or in containers.
//!
//! ## Commands
//!
//! - `pull-image`: provision the container image before serving builds
//! - `create-user` / `create-project` / `delete-project`
//! - `projects` / `info`: a user's projects, or one project, with the latest build
//! - `scan`: re-index a project's subdirs from disk
//! - `list`: show the indexed files of a subdir
//! - `build`: run one tracked build
//! - `builds`: build history of a project

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use remotex_build::{
    BuildContext, BuildExecutor, BuildMode, BuildTracker, ContainerExecutor, DockerCli,
    FatalReporter, NativeExecutor, ServerConfig, Supervisor, DEFAULT_IMAGE,
};
use remotex_core::{BuildOptions, BuildPolicy, Engine, ProjectService, RemotexError};
use remotex_state::{BuildRecord, Persistence, ProjectCatalog, Subdir, SurrealStore};
use tracing::{error, info, warn, Level};

/// Process exit status after an unrecoverable isolation failure.
const EXIT_UNRECOVERABLE: i32 = 70;

/// How long a running command may take to record its outcome once an
/// unrecoverable failure has been reported.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "remotexd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "remotex build service", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "REMOTEX_JSON_LOGS")]
    json: bool,

    /// SurrealDB endpoint (mem://, surrealkv://path, ws://host:port);
    /// defaults to a local database under --data-dir
    #[arg(long, global = true, env = "REMOTEX_DB_URL")]
    db_url: Option<String>,

    /// Directory holding the local database
    #[arg(long, global = true, env = "REMOTEX_DATA_DIR", default_value = ".remotexd")]
    data_dir: PathBuf,

    #[command(flatten)]
    server: ServerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Root directory of all project trees
    #[arg(long, global = true, env = "REMOTEX_PROJECTS_ROOT", default_value = "projects")]
    projects_root: PathBuf,

    /// Read-only include directory exposed to builds
    #[arg(long, global = true, env = "REMOTEX_SHARED_DIR")]
    shared_dir: Option<PathBuf>,

    /// native or container
    #[arg(long, global = true, env = "REMOTEX_BUILD_MODE", default_value = "native")]
    build_mode: BuildMode,

    /// Maximum build duration in seconds
    #[arg(long, global = true, env = "REMOTEX_MAX_BUILD_TIME", default_value_t = 120)]
    max_build_time: u64,

    /// Upload size limit in bytes
    #[arg(long, global = true, env = "REMOTEX_MAX_FILE_SIZE", default_value_t = 50 * 1024 * 1024)]
    max_file_size: u64,

    /// Let latexmk read rc files
    #[arg(long, global = true, env = "REMOTEX_ALLOW_AMBIENT_CONFIG")]
    allow_ambient_config: bool,

    /// Allow the lualatex engine
    #[arg(long, global = true, env = "REMOTEX_ALLOW_LUA")]
    allow_lua: bool,

    /// Container image for builds
    #[arg(long, global = true, env = "REMOTEX_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Seconds a container kill may take before it counts as failed
    #[arg(long, global = true, env = "REMOTEX_KILL_GRACE", default_value_t = 5)]
    kill_grace: u64,

    /// Native driver executable
    #[arg(long, global = true, env = "REMOTEX_DRIVER", default_value = "latexmk")]
    driver: String,
}

impl ServerArgs {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            projects_root: self.projects_root,
            shared_dir: self.shared_dir,
            build_mode: self.build_mode,
            max_build_time_secs: self.max_build_time,
            max_file_size: self.max_file_size,
            policy: BuildPolicy {
                allow_ambient_config: self.allow_ambient_config,
                allow_lua_engine: self.allow_lua,
            },
            container_image: self.image,
            kill_grace_secs: self.kill_grace,
            driver: self.driver,
        }
    }
}

#[derive(Args, Debug)]
struct ProjectRef {
    /// Owning user
    owner: String,
    /// Project name
    project: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull the container image used for builds
    PullImage,

    /// Create a user
    CreateUser { name: String },

    /// Create a project with empty src/aux/out trees
    CreateProject {
        #[command(flatten)]
        project: ProjectRef,

        /// Make the project public
        #[arg(long)]
        public: bool,
    },

    /// Delete a project, its files and its build history
    DeleteProject {
        #[command(flatten)]
        project: ProjectRef,
    },

    /// List a user's projects with their latest build
    Projects { owner: String },

    /// Show one project and its latest build
    Info {
        #[command(flatten)]
        project: ProjectRef,
    },

    /// Re-index every subdir of a project from disk
    Scan {
        #[command(flatten)]
        project: ProjectRef,
    },

    /// List the indexed files of a subdir
    List {
        #[command(flatten)]
        project: ProjectRef,

        /// src, aux or out
        #[arg(default_value = "src")]
        subdir: Subdir,
    },

    /// Run a build
    Build {
        #[command(flatten)]
        project: ProjectRef,

        /// pdf, lua or xe
        #[arg(short, long, default_value = "pdf")]
        engine: Engine,

        /// Continue past errors (-f -interaction=nonstopmode)
        #[arg(short, long)]
        force: bool,

        #[arg(long)]
        file_line_error: bool,

        /// Main document, relative to src
        #[arg(short, long)]
        document: Option<String>,

        /// Print a dependency list
        #[arg(long)]
        dependents: bool,

        /// Empty aux and out first
        #[arg(long)]
        clean: bool,
    },

    /// Show build history
    Builds {
        #[command(flatten)]
        project: ProjectRef,

        /// Maximum number of builds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

struct Services {
    service: Arc<ProjectService>,
    config: ServerConfig,
    reporter: FatalReporter,
}

impl Services {
    fn executor(&self) -> Arc<dyn BuildExecutor> {
        match self.config.build_mode {
            BuildMode::Native => Arc::new(NativeExecutor::new(
                self.config.driver.clone(),
                Vec::<String>::new(),
            )),
            BuildMode::Container => Arc::new(self.container()),
        }
    }

    fn container(&self) -> ContainerExecutor {
        ContainerExecutor::new(
            Arc::new(DockerCli::default()),
            self.config.container_image.clone(),
            self.config.kill_grace(),
            self.reporter.clone(),
        )
    }

    fn tracker(&self) -> BuildTracker {
        BuildTracker::new(self.service.clone(), self.executor(), self.config.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    remotex_core::telemetry::init_tracing(cli.json, level);

    let store = open_store(cli.db_url.as_deref(), &cli.data_dir).await?;
    let store: Arc<dyn Persistence> = Arc::new(store);

    let config = cli.server.into_config();
    let (mut supervisor, reporter) = Supervisor::new();
    let services = Services {
        service: Arc::new(ProjectService::new(
            config.projects_root.clone(),
            store,
            config.max_file_size,
        )),
        config,
        reporter,
    };

    services
        .tracker()
        .recover_stale_builds()
        .await
        .context("Failed to recover stale builds")?;

    let dispatched = dispatch(&services, cli.command);
    tokio::pin!(dispatched);
    let result = tokio::select! {
        result = &mut dispatched => result,
        Some(fatal) = supervisor.wait() => {
            error!(%fatal, "unrecoverable failure, terminating");
            // the running build still records its terminal state
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut dispatched).await.is_err() {
                warn!("command did not finish within the shutdown grace");
            }
            std::process::exit(EXIT_UNRECOVERABLE);
        }
    };
    if let Some(fatal) = supervisor.try_next() {
        error!(%fatal, "unrecoverable failure, terminating");
        std::process::exit(EXIT_UNRECOVERABLE);
    }
    result
}

/// `db_url` when given, otherwise a SurrealKV database under `data_dir`.
async fn open_store(db_url: Option<&str>, data_dir: &Path) -> Result<SurrealStore> {
    match db_url {
        Some(url) => SurrealStore::connect(url)
            .await
            .with_context(|| format!("Failed to connect to database at {url}")),
        None => {
            let path = data_dir.join("db");
            SurrealStore::open_local(&path)
                .await
                .with_context(|| format!("Failed to open database at {}", path.display()))
        }
    }
}

async fn dispatch(services: &Services, command: Commands) -> Result<()> {
    match command {
        Commands::PullImage => cmd_pull_image(services).await,
        Commands::CreateUser { name } => cmd_create_user(services, &name).await,
        Commands::CreateProject { project, public } => {
            cmd_create_project(services, &project, public).await
        }
        Commands::DeleteProject { project } => cmd_delete_project(services, &project).await,
        Commands::Projects { owner } => cmd_projects(services, &owner).await,
        Commands::Info { project } => cmd_info(services, &project).await,
        Commands::Scan { project } => cmd_scan(services, &project).await,
        Commands::List { project, subdir } => cmd_list(services, &project, subdir).await,
        Commands::Build {
            project,
            engine,
            force,
            file_line_error,
            document,
            dependents,
            clean,
        } => {
            let options = BuildOptions {
                engine,
                force,
                file_line_error,
                document,
                dependents,
                clean_build: clean,
            };
            cmd_build(services, &project, &options).await
        }
        Commands::Builds { project, limit } => cmd_builds(services, &project, limit).await,
    }
}

async fn cmd_pull_image(services: &Services) -> Result<()> {
    services
        .container()
        .pull_image()
        .await
        .context("Failed to pull build image")?;
    println!("Image ready: {}", services.config.container_image);
    Ok(())
}

async fn cmd_create_user(services: &Services, name: &str) -> Result<()> {
    remotex_core::validate_name(name)?;
    let user = services.service.store().create_user(name).await?;
    println!("Created user '{}'", user.name);
    Ok(())
}

async fn cmd_create_project(services: &Services, project: &ProjectRef, public: bool) -> Result<()> {
    let handle = services
        .service
        .create_project(&project.owner, &project.project, public)
        .await?;
    println!(
        "Created project {}/{} ({})",
        project.owner,
        project.project,
        handle.id()
    );
    Ok(())
}

async fn cmd_delete_project(services: &Services, project: &ProjectRef) -> Result<()> {
    services
        .service
        .delete_project(&project.owner, &project.project)
        .await?;
    println!("Deleted project {}/{}", project.owner, project.project);
    Ok(())
}

fn describe_build(build: Option<&BuildRecord>) -> String {
    match build {
        Some(b) => format!(
            "{} {} ({})",
            b.status,
            b.started_at.format("%Y-%m-%d %H:%M:%S"),
            b.build_id
        ),
        None => "never built".to_string(),
    }
}

async fn cmd_projects(services: &Services, owner: &str) -> Result<()> {
    let projects = services.service.list_projects(owner).await?;
    if projects.is_empty() {
        println!("No projects for {owner}");
        return Ok(());
    }
    for project in projects {
        let record = &project.handle.record;
        println!(
            "{:<24} {:<7} {}",
            record.name,
            if record.public { "public" } else { "private" },
            describe_build(project.latest_build.as_ref())
        );
    }
    Ok(())
}

async fn cmd_info(services: &Services, project: &ProjectRef) -> Result<()> {
    let info = services
        .service
        .project_info(&project.owner, &project.project)
        .await?;
    let record = &info.handle.record;
    println!("Project:  {}/{}", record.owner, record.name);
    println!("Id:       {}", record.project_id);
    println!("Public:   {}", record.public);
    println!("Created:  {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Latest:   {}", describe_build(info.latest_build.as_ref()));
    Ok(())
}

async fn cmd_scan(services: &Services, project: &ProjectRef) -> Result<()> {
    let handle = services
        .service
        .project(&project.owner, &project.project)
        .await?;
    for subdir in Subdir::ALL {
        let report = services.service.scan_subdir(&handle, subdir).await?;
        println!("{subdir}: {} files", report.manifest.len());
        for skipped in &report.skipped {
            println!("  skipped {}: {}", skipped.path, skipped.reason);
        }
    }
    Ok(())
}

async fn cmd_list(services: &Services, project: &ProjectRef, subdir: Subdir) -> Result<()> {
    let handle = services
        .service
        .project(&project.owner, &project.project)
        .await?;
    let files = services.service.list_files(&handle, subdir).await?;
    if files.is_empty() {
        println!("No files in {subdir}");
        return Ok(());
    }
    for file in files {
        println!("{}  {:>10}  {}", file.digest.short(), file.size, file.path);
    }
    Ok(())
}

async fn cmd_build(services: &Services, project: &ProjectRef, options: &BuildOptions) -> Result<()> {
    let tracker = services.tracker();
    let (ctx, cancel) = BuildContext::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling build");
            cancel.cancel();
        }
    });

    match tracker
        .run_build_within(&project.owner, &project.project, options, &ctx)
        .await
    {
        Ok(report) => {
            print!("{}", report.output);
            println!(
                "Build {} {} in {:.1}s",
                report.build_id,
                report.status,
                report.duration.as_secs_f64()
            );
            Ok(())
        }
        Err(e) => {
            if let Some(output) = e.output() {
                print!("{output}");
            }
            if let RemotexError::Driver { exit_code, .. } = e {
                error!(exit_code, "build failed");
                std::process::exit(exit_code);
            }
            Err(e.into())
        }
    }
}

async fn cmd_builds(services: &Services, project: &ProjectRef, limit: usize) -> Result<()> {
    let tracker = services.tracker();
    let builds = tracker
        .list_builds(&project.owner, &project.project)
        .await?;
    if builds.is_empty() {
        println!("No builds for {}/{}", project.owner, project.project);
        return Ok(());
    }
    for build in builds.into_iter().take(limit) {
        println!(
            "{}  {}  {:>7}ms  {}",
            build.build_id,
            build.started_at.format("%Y-%m-%d %H:%M:%S"),
            build.duration_ms,
            build.status
        );
        println!("    options: {}", serde_json::to_string(&build.options)?);
    }
    Ok(())
}
