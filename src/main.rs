use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cadence_lite::config::{
    parse_tags, DeadlinePolicy, GossipConfig, LeaseConfig, NodeConfig, StoreBackend,
};
use cadence_lite::dispatcher::DispatchResult;
use cadence_lite::membership::{MemberStatus, Node as Member};
use cadence_lite::node::Node;
use cadence_lite::scheduler::{ConcurrencyPolicy, Execution, Job, JobAction};
use cadence_lite::shutdown::install_shutdown_handler;
use cadence_lite::store::LeadershipToken;

#[derive(Parser, Debug)]
#[command(name = "cadence-lite")]
#[command(version)]
#[command(about = "A distributed cron scheduler with lease-based leader election")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a cadence-lite agent
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Node name (unique in the cluster)
    #[arg(long, default_value = "node-1")]
    name: String,

    /// Address to listen on for HTTP (API, gossip and internal RPC)
    #[arg(long, default_value = "127.0.0.1:8946")]
    bind: SocketAddr,

    /// host:port advertised to peers (defaults to --bind)
    #[arg(long)]
    advertise: Option<String>,

    /// Node tags used for job placement (comma-separated key=value)
    /// Example: "role=worker,dc=eu-1"
    #[arg(long, default_value = "")]
    tags: String,

    /// Nodes to join on startup (comma-separated host:port)
    #[arg(long, default_value = "")]
    join: String,

    // === Store Options ===
    /// URL of a node serving the shared store (e.g. http://10.0.0.1:8946).
    /// Without it the agent uses its own embedded store.
    #[arg(long, conflicts_with = "serve_store")]
    store_url: Option<String>,

    /// Serve the embedded store to other agents
    #[arg(long)]
    serve_store: bool,

    // === Timing Options ===
    /// Leadership lease TTL in milliseconds
    #[arg(long, default_value = "10000")]
    lease_ms: u64,

    /// Leadership renewal interval in milliseconds
    #[arg(long, default_value = "2000")]
    renew_ms: u64,

    /// Gossip interval in milliseconds
    #[arg(long, default_value = "500")]
    gossip_ms: u64,

    /// Count timed-out runs as errors in job statistics
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    timeouts_are_errors: bool,

    /// Maximum captured output per execution, in bytes
    #[arg(long, default_value = "65536")]
    max_output_bytes: usize,
}

// =============================================================================
// Client Arguments (shared by job and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Agent address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8946")]
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
    /// List all jobs
    List,
    /// Show one job with its statistics
    Get {
        /// The job name
        name: String,
    },
    /// Create or replace a job
    Put {
        /// The job name (ignored with --file)
        #[arg(required_unless_present = "file")]
        name: Option<String>,

        /// Read the full job definition from a JSON file
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,

        /// Cron expression (5 or 6 fields) or an interval like "@every 30s"
        #[arg(long, required_unless_present = "file")]
        schedule: Option<String>,

        /// Shell command to run
        #[arg(long, required_unless_present = "file")]
        command: Option<String>,

        /// Placement tags (comma-separated key=value)
        #[arg(long, default_value = "")]
        tags: String,

        /// Number of matching nodes to run on (0 = all)
        #[arg(long, default_value = "1")]
        count: usize,

        /// Concurrency policy
        #[arg(long, default_value = "allow")]
        concurrency: ConcurrencyArg,

        /// Jobs to trigger after a successful run (comma-separated)
        #[arg(long, default_value = "")]
        dependents: String,

        /// Per-run deadline in seconds (0 = none)
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Store the job disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a job and its execution history
    Delete {
        name: String,
    },
    /// Run a job now, outside its schedule
    Run {
        name: String,
    },
    /// Show a job's execution history
    Executions {
        name: String,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum ConcurrencyArg {
    Allow,
    Forbid,
    Replace,
}

impl From<ConcurrencyArg> for ConcurrencyPolicy {
    fn from(arg: ConcurrencyArg) -> Self {
        match arg {
            ConcurrencyArg::Allow => ConcurrencyPolicy::Allow,
            ConcurrencyArg::Forbid => ConcurrencyPolicy::Forbid,
            ConcurrencyArg::Replace => ConcurrencyPolicy::Replace,
        }
    }
}

// =============================================================================
// Cluster Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// List cluster members as seen by the agent
    Members,
    /// Show the current leader
    Leader,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

fn action_summary(action: &JobAction) -> String {
    match action {
        JobAction::Shell { command, args } if args.is_empty() => command.clone(),
        JobAction::Shell { command, args } => format!("{} {}", command, args.join(" ")),
        JobAction::Http { url, method, .. } => format!("{} {}", method, url),
    }
}

struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Turn non-2xx replies into an error carrying the server's message.
    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed")
            .to_string();
        match body.get("leader").and_then(|l| l.as_str()) {
            Some(leader) => Err(format!("{} ({}), leader at {}", message, status, leader).into()),
            None => Err(format!("{} ({})", message, status).into()),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        Self::decode(self.http.get(self.url(path)).send().await?).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&Job>,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::decode(request.send().await?).await
    }

    async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Box<dyn std::error::Error>> {
        Self::decode(self.http.delete(self.url(path)).send().await?).await
    }
}

// =============================================================================
// Agent Implementation
// =============================================================================

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.renew_ms * 2 >= args.lease_ms {
        return Err("--renew-ms must be less than half of --lease-ms".into());
    }

    let store = match args.store_url {
        Some(url) => StoreBackend::Remote { url },
        None => StoreBackend::Embedded,
    };
    if store == StoreBackend::Embedded && !args.serve_store && !args.join.is_empty() {
        tracing::warn!(
            "Joining a cluster with a private embedded store. \
             Use --store-url or --serve-store so agents share job state."
        );
    }

    let mut config = NodeConfig::new(args.name, args.bind).with_store(store);
    config.advertise_addr = args.advertise;
    config.tags = parse_tags(&args.tags);
    config.seeds = split_list(&args.join);
    config.serve_store = args.serve_store;
    config.lease = LeaseConfig {
        lease_ms: args.lease_ms,
        renew_interval_ms: args.renew_ms,
    };
    config.gossip = GossipConfig {
        interval_ms: args.gossip_ms,
        ..GossipConfig::default()
    };
    config.runner.max_output_bytes = args.max_output_bytes;
    config.runner.deadline_policy = if args.timeouts_are_errors {
        DeadlinePolicy::CountAsError
    } else {
        DeadlinePolicy::TrackSeparately
    };

    tracing::info!(
        node = %config.node_name,
        bind = %config.bind_addr,
        advertise = %config.advertised(),
        tags = ?config.tags,
        seeds = ?config.seeds,
        store = ?config.store,
        serve_store = config.serve_store,
        "Starting cadence-lite agent"
    );

    let node = Node::new(config)?;
    node.run(install_shutdown_handler()).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<24} {:<20} {:<8} {:<8} {:<6} {:<6} ACTION",
        "NAME", "SCHEDULE", "ENABLED", "POLICY", "OK", "ERR"
    );
    println!("{}", "-".repeat(96));
    for job in jobs {
        println!(
            "{:<24} {:<20} {:<8} {:<8} {:<6} {:<6} {}",
            truncate(&job.name, 24),
            truncate(&job.schedule, 20),
            job.enabled,
            job.concurrency,
            job.stats.success_count,
            job.stats.error_count,
            truncate(&action_summary(&job.action), 30)
        );
    }
    println!();
    println!("{} job(s)", jobs.len());
}

fn print_job(job: &Job) {
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };
    println!("Name:        {}", job.name);
    println!("Schedule:    {}", job.schedule);
    println!("Action:      {}", action_summary(&job.action));
    println!("Enabled:     {}", job.enabled);
    println!("Concurrency: {}", job.concurrency);
    if job.placement.tags.is_empty() {
        println!("Placement:   any node, count {}", job.placement.count);
    } else {
        let tags: Vec<String> = job
            .placement
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "Placement:   {}, count {}",
            tags.join(","),
            job.placement.count
        );
    }
    if job.timeout_secs > 0 {
        println!("Timeout:     {}s", job.timeout_secs);
    }
    if !job.dependents.is_empty() {
        println!("Dependents:  {}", job.dependents.join(", "));
    }
    println!();
    println!("Statistics");
    println!("{}", "=".repeat(40));
    println!("Succeeded:    {}", job.stats.success_count);
    println!("Errors:       {}", job.stats.error_count);
    println!("Timeouts:     {}", job.stats.timeout_count);
    println!("Skipped:      {}", job.stats.skipped_count);
    println!("Last run:     {}", fmt_time(job.stats.last_run));
    println!("Last success: {}", fmt_time(job.stats.last_success));
    println!("Last error:   {}", fmt_time(job.stats.last_error));
}

async fn handle_job_put(
    client: &ApiClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let JobCommands::Put {
        name,
        file,
        schedule,
        command,
        tags,
        count,
        concurrency,
        dependents,
        timeout,
        disabled,
    } = command
    else {
        return Err("not a put command".into());
    };

    let job = match file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str::<Job>(&raw)
                .map_err(|e| format!("invalid job file {}: {}", path.display(), e))?
        }
        None => {
            let (Some(name), Some(schedule), Some(command)) = (name, schedule, command) else {
                return Err("name, --schedule and --command are required without --file".into());
            };
            let mut job = Job::new(name, schedule, JobAction::shell(command))
                .with_concurrency(concurrency.into())
                .with_timeout(timeout);
            job.placement.tags = parse_tags(&tags);
            job.placement.count = count;
            job.dependents = split_list(&dependents);
            if disabled {
                job = job.disabled();
            }
            job
        }
    };

    let saved: Job = client.post("/v1/jobs", Some(&job)).await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&saved)?),
        OutputFormat::Table => {
            println!("Job saved: {}", saved.name);
            println!();
            println!("Check its history with:");
            println!("  cadence-lite job executions {}", saved.name);
        }
    }
    Ok(())
}

async fn handle_job_run(
    client: &ApiClient,
    name: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let result: DispatchResult = client.post(&format!("/v1/jobs/{}", name), None).await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Table => match result {
            DispatchResult::Dispatched {
                group,
                targets,
                failed,
            } => {
                println!("Run started: {}", group);
                println!("Targets:     {}", targets.join(", "));
                if !failed.is_empty() {
                    println!("Unreachable: {}", failed.join(", "));
                }
            }
            DispatchResult::Skipped { reason } => println!("Run skipped: {}", reason),
            DispatchResult::PlacementFailed { reason } => {
                println!("No node can run this job: {}", reason)
            }
            DispatchResult::Unavailable { reason } => println!("Run not started: {}", reason),
        },
    }
    Ok(())
}

fn print_executions(executions: &[Execution]) {
    if executions.is_empty() {
        println!("No executions found.");
        return;
    }
    println!(
        "{:<38} {:<14} {:<16} {:<26} EXIT",
        "GROUP", "NODE", "STATUS", "STARTED"
    );
    println!("{}", "-".repeat(100));
    for execution in executions {
        let exit = execution
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<14} {:<16} {:<26} {}",
            execution.group,
            truncate(&execution.node, 14),
            execution.status,
            execution.started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            exit
        );
    }
    println!();
    println!("{} execution(s)", executions.len());
}

async fn handle_job_command(
    client: &ApiClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::List => {
            let jobs: Vec<Job> = client.get("/v1/jobs").await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => print_jobs(&jobs),
            }
        }
        JobCommands::Get { name } => {
            let job: Job = client.get(&format!("/v1/jobs/{}", name)).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        put @ JobCommands::Put { .. } => handle_job_put(client, put, output_format).await?,
        JobCommands::Delete { name } => {
            let job: Job = client.delete(&format!("/v1/jobs/{}", name)).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => println!("Job deleted: {}", job.name),
            }
        }
        JobCommands::Run { name } => handle_job_run(client, &name, output_format).await?,
        JobCommands::Executions { name } => {
            let executions: Vec<Execution> =
                client.get(&format!("/v1/executions/{}", name)).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&executions)?),
                OutputFormat::Table => print_executions(&executions),
            }
        }
    }
    Ok(())
}

async fn handle_cluster_members(
    client: &ApiClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let members: Vec<Member> = client.get("/v1/members").await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&members)?),
        OutputFormat::Table => {
            println!("{:<16} {:<25} {:<12} TAGS", "NAME", "ADDRESS", "STATUS");
            println!("{}", "-".repeat(70));
            for member in members {
                let status_icon = match member.status {
                    MemberStatus::Alive => "[+]",
                    MemberStatus::Suspect => "[?]",
                    MemberStatus::Dead | MemberStatus::Left => "[-]",
                };
                let name = if member.leader {
                    format!("{} *", member.name)
                } else {
                    member.name.clone()
                };
                let tags: Vec<String> = member
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                println!(
                    "{:<16} {:<25} {} {:<8} {}",
                    name,
                    member.addr,
                    status_icon,
                    member.status,
                    tags.join(",")
                );
            }
        }
    }
    Ok(())
}

async fn handle_cluster_leader(
    client: &ApiClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let token: LeadershipToken = client.get("/v1/leader").await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&token)?),
        OutputFormat::Table => {
            println!("Leader:   {}", token.holder);
            println!("Address:  {}", token.addr);
            println!("Term:     {}", token.term);
            println!("Since:    {}", token.acquired_at.to_rfc3339());
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Agent(agent_args) => {
            run_agent(agent_args).await?;
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr);
            handle_job_command(&api, command, &client.output).await?;
        }
        Commands::Cluster { client, command } => {
            let api = ApiClient::new(&client.addr);
            match command {
                ClusterCommands::Members => {
                    handle_cluster_members(&api, &client.output).await?;
                }
                ClusterCommands::Leader => {
                    handle_cluster_leader(&api, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
