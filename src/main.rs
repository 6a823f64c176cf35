use std::fs::OpenOptions;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use caas::config::CaasConfig;
use caas::grpc::state_from_proto;
use caas::node::Node;
use caas::proto::scheduler_service_client::SchedulerServiceClient;
use caas::proto::{
    CancelJobRequest, FetchResultRequest, GetJobStatusRequest, IssueCredentialsRequest, JobInfo,
    ListJobsRequest, ResolveAliasRequest, SubmitJobRequest, ValidateCredentialsRequest,
};
use caas::scheduler::job::JobState;
use caas::services::Services;
use caas::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "caas")]
#[command(version)]
#[command(about = "Cyclus-as-a-Service: a filesystem-backed simulation job scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler service
    Serve(ServeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Credential commands
    Creds {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: CredsCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "4242")]
    port: u16,

    /// Port for the HTTP status API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Configuration directory (job counter, aliases, credentials)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Data directory (job states, simulations, artifacts)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Parent of the per-state job directories
    #[arg(long)]
    jobs_dir: Option<PathBuf>,

    #[arg(long)]
    jobid_file: Option<PathBuf>,

    #[arg(long)]
    job_aliases_file: Option<PathBuf>,

    /// Seconds a finished job is kept before it is removed
    #[arg(long)]
    holding_time: Option<u64>,

    /// Maximum number of concurrently running jobs
    #[arg(long)]
    njobs: Option<usize>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    logfile: Option<PathBuf>,

    #[arg(long)]
    sims_dir: Option<PathBuf>,

    #[arg(long)]
    paths_dir: Option<PathBuf>,

    /// Remote data service URL (empty for in-process)
    #[arg(long, default_value = "")]
    data_url: String,

    /// Remote credentials service URL (empty for in-process)
    #[arg(long, default_value = "")]
    creds_url: String,

    /// Remote batch service URL (empty for in-process)
    #[arg(long, default_value = "")]
    batch_url: String,

    #[arg(long)]
    creds_dir: Option<PathBuf>,

    #[arg(long)]
    completed_jobs_dir: Option<PathBuf>,

    #[arg(long)]
    failed_jobs_dir: Option<PathBuf>,

    #[arg(long)]
    canceled_jobs_dir: Option<PathBuf>,

    #[arg(long)]
    queued_jobs_dir: Option<PathBuf>,

    #[arg(long)]
    running_jobs_dir: Option<PathBuf>,

    /// Peer services to export: "all" or a comma list of data, creds, batch
    #[arg(long, default_value = "all")]
    services: Services,

    /// Simulation command, whitespace separated; {input}, {output} and
    /// {jobid} are substituted
    #[arg(long)]
    runner: Option<String>,
}

// =============================================================================
// Client Arguments (shared by job and creds commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:4242")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a simulation input file ("-" reads stdin)
    Submit {
        #[arg(long)]
        user: String,
        #[arg(long)]
        project: String,
        /// Alias to register for the job
        #[arg(long)]
        name: Option<String>,
        input: PathBuf,
    },
    /// Get status of a specific job
    Status { jobid: u64 },
    /// Cancel a queued or running job
    Cancel { jobid: u64 },
    /// List jobs
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Use the streaming API
        #[arg(short, long)]
        stream: bool,
    },
    /// Fetch a finished job's result
    Result {
        jobid: u64,
        /// Write the output database here
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Resolve an alias to jobids
    Alias {
        #[arg(long)]
        user: String,
        #[arg(long)]
        project: String,
        name: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CredsCommands {
    /// Issue a token for a user
    Issue {
        #[arg(long)]
        user: String,
    },
    /// Show which user a token belongs to
    Validate { token: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    jobid: u64,
    created_at_ms: i64,
}

#[derive(Serialize)]
struct JobOutput {
    jobid: u64,
    user: String,
    project: String,
    name: String,
    state: String,
    created_at_ms: i64,
    transitioned_at_ms: i64,
    exit_code: Option<i32>,
    error: String,
}

impl From<JobInfo> for JobOutput {
    fn from(job: JobInfo) -> Self {
        Self {
            state: state_name(job.state),
            jobid: job.jobid,
            user: job.user,
            project: job.project,
            name: job.name,
            created_at_ms: job.created_at_ms,
            transitioned_at_ms: job.transitioned_at_ms,
            exit_code: job.exit_code,
            error: job.error,
        }
    }
}

#[derive(Serialize)]
struct JobResultOutput {
    job: Option<JobOutput>,
    output: String,
    error: String,
    artifact_bytes: Option<usize>,
    saved_to: Option<PathBuf>,
}

#[derive(Serialize)]
struct AliasTargetOutput {
    jobid: u64,
    state: Option<String>,
}

#[derive(Serialize)]
struct CredentialOutput {
    token: String,
    user: String,
    issued_at_ms: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn state_name(state: i32) -> String {
    state_from_proto(state)
        .map(|s| s.as_str().to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn init_logging(logfile: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match logfile {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn build_config(args: ServeArgs) -> CaasConfig {
    let config_dir = args
        .config_dir
        .unwrap_or_else(|| home_dir().join(".config").join("caas"));
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| home_dir().join(".local").join("share").join("caas"));

    let mut config = CaasConfig::with_roots(config_dir, data_dir);
    if let Some(jobs_dir) = args.jobs_dir {
        config = config.with_jobs_dir(jobs_dir);
    }

    config.port = args.port;
    config.dashboard_port = args.dashboard_port;
    config.logfile = args.logfile;
    config.data_url = args.data_url;
    config.creds_url = args.creds_url;
    config.batch_url = args.batch_url;
    config.services = args.services;

    let overrides = [
        (args.jobid_file, &mut config.jobid_file),
        (args.job_aliases_file, &mut config.job_aliases_file),
        (args.sims_dir, &mut config.sims_dir),
        (args.paths_dir, &mut config.paths_dir),
        (args.creds_dir, &mut config.creds_dir),
        (args.queued_jobs_dir, &mut config.queued_jobs_dir),
        (args.running_jobs_dir, &mut config.running_jobs_dir),
        (args.completed_jobs_dir, &mut config.completed_jobs_dir),
        (args.failed_jobs_dir, &mut config.failed_jobs_dir),
        (args.canceled_jobs_dir, &mut config.canceled_jobs_dir),
    ];
    for (value, field) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }

    if let Some(secs) = args.holding_time {
        config.holding_time = Duration::from_secs(secs);
    }
    if let Some(njobs) = args.njobs {
        config.njobs = njobs;
    }
    if let Some(runner) = args.runner {
        config.runner = runner.split_whitespace().map(str::to_string).collect();
    }
    config
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(args);
    init_logging(config.logfile.as_ref())?;

    tracing::info!(
        port = config.port,
        dashboard_port = ?config.dashboard_port,
        data_dir = %config.data_dir.display(),
        config_dir = %config.config_dir.display(),
        njobs = config.njobs,
        holding_time_secs = config.holding_time.as_secs(),
        services = %config.services,
        "Starting caas"
    );

    let node = Node::new(config)?;
    let shutdown = install_shutdown_handler()?;
    node.run(shutdown).await?;

    tracing::info!("caas stopped");
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &mut SchedulerServiceClient<Channel>,
    user: String,
    project: String,
    name: Option<String>,
    input: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = if input.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        tokio::fs::read_to_string(&input).await?
    };

    let response = client
        .submit_job(SubmitJobRequest {
            user,
            project,
            name: name.unwrap_or_default(),
            payload,
        })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => print_json(&JobSubmitOutput {
            jobid: response.jobid,
            created_at_ms: response.created_at_ms,
        })?,
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response.jobid);
        }
    }
    Ok(())
}

fn print_job(job: JobInfo, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => print_json(&JobOutput::from(job))?,
        OutputFormat::Table => {
            println!("Job ID:    {}", job.jobid);
            println!("State:     {}", state_name(job.state));
            println!("User:      {}", job.user);
            println!("Project:   {}", job.project);
            if !job.name.is_empty() {
                println!("Alias:     {}", job.name);
            }
            if let Some(exit_code) = job.exit_code {
                println!("Exit Code: {}", exit_code);
            }
            if !job.error.is_empty() {
                println!("Error:");
                for line in job.error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &mut SchedulerServiceClient<Channel>,
    state: Option<JobState>,
    stream: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = ListJobsRequest {
        state: state.map(|s| caas::grpc::state_to_proto(s) as i32).unwrap_or(0),
    };

    let jobs: Vec<JobInfo> = if stream {
        let mut job_stream = client.stream_jobs(request).await?.into_inner();
        let mut jobs = Vec::new();
        while let Some(result) = job_stream.next().await {
            match result {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    eprintln!("Stream error: {}", e);
                    break;
                }
            }
        }
        jobs
    } else {
        client.list_jobs(request).await?.into_inner().jobs
    };

    match output_format {
        OutputFormat::Json => {
            let jobs: Vec<JobOutput> = jobs.into_iter().map(JobOutput::from).collect();
            print_json(&jobs)?;
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<8} {:<10} {:<12} {:<16} ALIAS",
                    "JOB ID", "STATE", "USER", "PROJECT"
                );
                println!("{}", "-".repeat(60));
                for job in &jobs {
                    println!(
                        "{:<8} {:<10} {:<12} {:<16} {}",
                        job.jobid,
                        state_name(job.state),
                        job.user,
                        job.project,
                        job.name
                    );
                }
                println!();
                println!("{} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_job_result(
    client: &mut SchedulerServiceClient<Channel>,
    jobid: u64,
    save: Option<PathBuf>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .fetch_result(FetchResultRequest { jobid })
        .await?
        .into_inner();

    let saved_to = match (&save, response.has_artifact) {
        (Some(path), true) => {
            tokio::fs::write(path, &response.artifact).await?;
            Some(path.clone())
        }
        _ => None,
    };

    match output_format {
        OutputFormat::Json => print_json(&JobResultOutput {
            job: response.job.map(JobOutput::from),
            output: response.output,
            error: response.error,
            artifact_bytes: response.has_artifact.then_some(response.artifact.len()),
            saved_to,
        })?,
        OutputFormat::Table => {
            if let Some(job) = response.job {
                println!("Job ID:   {}", job.jobid);
                println!("State:    {}", state_name(job.state));
            }
            if response.has_artifact {
                println!("Artifact: {} bytes", response.artifact.len());
            }
            if let Some(path) = saved_to {
                println!("Saved to: {}", path.display());
            } else if save.is_some() {
                println!("No artifact to save.");
            }
            if !response.output.is_empty() {
                println!("Output:");
                for line in response.output.lines() {
                    println!("  {}", line);
                }
            }
            if !response.error.is_empty() {
                println!("Error:");
                for line in response.error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_alias(
    client: &mut SchedulerServiceClient<Channel>,
    user: String,
    project: String,
    name: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let targets: Vec<AliasTargetOutput> = client
        .resolve_alias(ResolveAliasRequest {
            user,
            project,
            name,
        })
        .await?
        .into_inner()
        .targets
        .into_iter()
        .map(|t| AliasTargetOutput {
            jobid: t.jobid,
            state: t.found.then(|| state_name(t.state)),
        })
        .collect();

    match output_format {
        OutputFormat::Json => print_json(&targets)?,
        OutputFormat::Table => {
            println!("{:<8} STATE", "JOB ID");
            println!("{}", "-".repeat(24));
            for target in targets {
                println!(
                    "{:<8} {}",
                    target.jobid,
                    target.state.as_deref().unwrap_or("NOT FOUND")
                );
            }
        }
    }
    Ok(())
}

async fn handle_creds(
    client: &mut SchedulerServiceClient<Channel>,
    command: CredsCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CredsCommands::Issue { user } => {
            let credential = client
                .issue_credentials(IssueCredentialsRequest { user })
                .await?
                .into_inner();
            match output_format {
                OutputFormat::Json => print_json(&CredentialOutput {
                    token: credential.token,
                    user: credential.user,
                    issued_at_ms: credential.issued_at_ms,
                })?,
                OutputFormat::Table => {
                    println!("User:  {}", credential.user);
                    println!("Token: {}", credential.token);
                }
            }
        }
        CredsCommands::Validate { token } => {
            let user = client
                .validate_credentials(ValidateCredentialsRequest { token })
                .await?
                .into_inner()
                .user;
            match output_format {
                OutputFormat::Json => print_json(&serde_json::json!({ "user": user }))?,
                OutputFormat::Table => println!("Valid token for user: {}", user),
            }
        }
    }
    Ok(())
}

async fn connect(args: &ClientArgs) -> Result<SchedulerServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    Ok(SchedulerServiceClient::new(channel)
        .max_decoding_message_size(caas::services::remote::MAX_MESSAGE_BYTES))
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Job { client, command } => {
            let mut grpc_client = connect(&client).await?;

            match command {
                JobCommands::Submit {
                    user,
                    project,
                    name,
                    input,
                } => {
                    handle_job_submit(&mut grpc_client, user, project, name, input, &client.output)
                        .await?;
                }
                JobCommands::Status { jobid } => {
                    let job = grpc_client
                        .get_job_status(GetJobStatusRequest { jobid })
                        .await?
                        .into_inner();
                    print_job(job, &client.output)?;
                }
                JobCommands::Cancel { jobid } => {
                    let job = grpc_client
                        .cancel_job(CancelJobRequest { jobid })
                        .await?
                        .into_inner();
                    print_job(job, &client.output)?;
                }
                JobCommands::List { state, stream } => {
                    handle_job_list(&mut grpc_client, state, stream, &client.output).await?;
                }
                JobCommands::Result { jobid, save } => {
                    handle_job_result(&mut grpc_client, jobid, save, &client.output).await?;
                }
                JobCommands::Alias {
                    user,
                    project,
                    name,
                } => {
                    handle_job_alias(&mut grpc_client, user, project, name, &client.output)
                        .await?;
                }
            }
        }
        Commands::Creds { client, command } => {
            let mut grpc_client = connect(&client).await?;
            handle_creds(&mut grpc_client, command, &client.output).await?;
        }
    }

    Ok(())
}
