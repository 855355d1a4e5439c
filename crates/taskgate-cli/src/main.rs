mod operator;

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use taskgate_approval::{ApprovalConfig, ApprovalGate, ApprovalMode, ChannelApprovalSurface};
use taskgate_domain::{RequesterChannel, RunId, UserMode};
use taskgate_orchestrator::{Orchestrator, RunConfig, StaticToolRegistry, TracingProgressSink};
use taskgate_policy::{
    build_context, FilePolicySource, HttpPolicySource, PolicyDocument, PolicyEngine,
    SyncOutcome, TracingAuditSink,
};
use taskgate_workflow::{load_plan_from_path, PlanEnvelope, PlanValidation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_REQUESTER: &str = "terminal";

#[derive(Debug, Parser)]
#[command(name = "taskgate")]
#[command(about = "Policy-gated execution of tool task graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a task plan and print the run summary.
    ///
    /// Only the builtin `echo` tool is registered, so tasks naming any other
    /// tool fail with "tool not found".
    Run(RunArgs),
    /// Classify a single tool call against the policy.
    Evaluate(EvaluateArgs),
    /// Normalize and check a task plan without running it.
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
struct PolicyArgs {
    #[arg(long, conflicts_with = "policy_url")]
    policy: Option<PathBuf>,
    #[arg(long)]
    policy_url: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    policy: PolicyArgs,
    #[arg(long, default_value_t = false)]
    auto_approve: bool,
    #[arg(long, value_parser = parse_user_mode)]
    user_mode: Option<UserMode>,
    #[arg(long)]
    approval_timeout_ms: Option<u64>,
    #[arg(long)]
    max_concurrency: Option<NonZeroUsize>,
    #[arg(long, default_value_t = false)]
    strict: bool,
    /// Correlation id for the run; a fresh one is generated when omitted.
    #[arg(long, value_parser = parse_run_id)]
    run_id: Option<RunId>,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    #[arg(long)]
    tool: String,
    /// Tool arguments as a JSON object.
    #[arg(long)]
    args: Option<String>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long, value_parser = parse_user_mode)]
    user_mode: Option<UserMode>,
    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long, default_value_t = false)]
    strict: bool,
}

/// Optional YAML file bundling engine settings; flags override each field.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EngineConfig {
    policy: Option<PolicyDocument>,
    policy_url: Option<String>,
    approval: ApprovalConfig,
    max_concurrency: Option<NonZeroUsize>,
    user_mode: Option<UserMode>,
    requester: Option<String>,
}

impl EngineConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Evaluate(args) => evaluate_command(&args),
        Commands::Validate(args) => validate_command(&args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(args: &RunArgs) -> Result<ExitCode> {
    let validation = plan_validation(args.strict);
    let plan = load_plan_from_path(&args.plan, validation)?;
    let config = EngineConfig::load(args.config.as_deref())?;

    // Policy sources may block on the network, so they are resolved before the runtime starts.
    let policy_url = args.policy.policy_url.clone().or(config.policy_url.clone());
    let policy = build_policy(
        args.policy.policy.as_deref(),
        policy_url.as_deref(),
        config.policy.as_ref(),
    )?;

    let mut approval = config.approval.clone();
    if args.auto_approve {
        approval.mode = ApprovalMode::AutoApprove;
    }
    if let Some(timeout_ms) = args.approval_timeout_ms {
        approval.timeout_ms = timeout_ms;
    }

    let run_config = RunConfig {
        run_id: args.run_id,
        user_mode: args.user_mode.or(config.user_mode).unwrap_or_default(),
        requester: RequesterChannel::new(
            config
                .requester
                .unwrap_or_else(|| DEFAULT_REQUESTER.to_string()),
        ),
        max_concurrency: args.max_concurrency.or(config.max_concurrency),
        plan_validation: validation,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let summary = runtime.block_on(execute(plan, policy, approval, &run_config))?;

    write_json(&serde_json::to_value(&summary)?, args.out.as_deref())?;
    Ok(if summary.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn execute(
    plan: PlanEnvelope,
    policy: PolicyEngine,
    approval: ApprovalConfig,
    config: &RunConfig,
) -> Result<taskgate_domain::RunSummary> {
    let (surface, prompts) = ChannelApprovalSurface::new();
    let gate = Arc::new(ApprovalGate::new(approval, Arc::new(surface)));
    let operator = tokio::spawn(operator::answer_prompts(Arc::clone(&gate), prompts));

    let orchestrator = Orchestrator::new(
        Arc::new(StaticToolRegistry::builtin()),
        Arc::new(policy),
        gate,
    )
    .with_progress_sink(Arc::new(TracingProgressSink));

    let summary = orchestrator.execute_plan(plan, config).await;
    operator.abort();
    summary.context("run aborted")
}

fn evaluate_command(args: &EvaluateArgs) -> Result<ExitCode> {
    let engine = build_policy(
        args.policy.policy.as_deref(),
        args.policy.policy_url.as_deref(),
        None,
    )?;

    let tool_args: Value = match &args.args {
        Some(text) => serde_json::from_str(text).context("--args must be valid JSON")?,
        None => Value::Object(Map::new()),
    };
    let mut context = build_context(
        &args.tool,
        tool_args,
        args.user_mode.unwrap_or_default(),
        None,
    );
    if args.url.is_some() {
        context.url.clone_from(&args.url);
        context.domain = None;
    }

    let evaluation = engine.evaluate(&context);
    write_json(&serde_json::to_value(&evaluation)?, None)?;
    Ok(ExitCode::SUCCESS)
}

fn validate_command(args: &ValidateArgs) -> Result<ExitCode> {
    let plan = load_plan_from_path(&args.plan, plan_validation(args.strict))?;
    write_json(
        &json!({
            "plan_name": plan.plan_name,
            "plan_hash": plan.plan_hash,
            "tasks": plan.tasks.len(),
        }),
        None,
    )?;
    Ok(ExitCode::SUCCESS)
}

fn build_policy(
    file: Option<&Path>,
    url: Option<&str>,
    inline: Option<&PolicyDocument>,
) -> Result<PolicyEngine> {
    let engine = match inline {
        Some(document) => {
            PolicyEngine::from_document(document).context("invalid policy in engine config")?
        }
        None => PolicyEngine::default(),
    }
    .with_audit_sink(Arc::new(TracingAuditSink));

    let outcome = match (file, url) {
        (Some(path), _) => Some(engine.sync_from(&FilePolicySource::new(path))),
        (None, Some(url)) => Some(engine.sync_from(&HttpPolicySource::new(url))),
        (None, None) => None,
    };
    if let Some(SyncOutcome::KeptCached { reason, .. }) = outcome {
        eprintln!("warning: policy not loaded ({reason}); using cached rules");
    }

    Ok(engine)
}

fn plan_validation(strict: bool) -> PlanValidation {
    if strict {
        PlanValidation::Strict
    } else {
        PlanValidation::Lenient
    }
}

fn parse_run_id(value: &str) -> Result<RunId, String> {
    value.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn parse_user_mode(value: &str) -> Result<UserMode, String> {
    UserMode::parse(value).ok_or_else(|| format!("unknown user mode '{value}'"))
}

fn write_json(value: &Value, out: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => fs::write(path, format!("{text}\n"))
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}
