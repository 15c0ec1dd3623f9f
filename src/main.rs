use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use cadence::config::Config;
use cadence::gates::{GateStatus, PipelineStage, Profile};
use cadence::orchestration::clamp_worker_count;
use cadence::{clog, clog_warn, Collaborators, Error, Orchestrator, Result, RunOutcome};
use cadence::{SessionStatus, SessionStore};

/// Where `run` keeps a copy of the plan so `resume` can find it.
const SAVED_PLAN: &str = "plan.toml";

/// Cadence - autonomous task orchestration with gated checkpoints
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)\n    CADENCE_LOG=level   Set the log level (error, warn, info, debug, trace)"
)]
pub struct Cli {
    /// Enable debug logging (writes to .cadence/cadence.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a new session from a TOML plan file
    Run {
        /// Plan file with [[tasks]] entries
        plan: PathBuf,

        /// Description of the overall change (defaults to the plan name)
        #[arg(long)]
        prompt: Option<String>,

        /// Number of workers; more than one enables the swarm (3-20)
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Approve tasks that require sign-off without asking
        #[arg(short = 't', long)]
        trust: bool,

        /// Ask approval and blocker questions on the terminal
        #[arg(short = 'i', long)]
        interactive: bool,

        /// Upper bound on Evaluate -> Execute iterations
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Continue the saved session
    Resume {
        /// Plan file, if the session stopped before planning
        #[arg(long)]
        plan: Option<PathBuf>,

        #[arg(short = 't', long)]
        trust: bool,

        #[arg(short = 'i', long)]
        interactive: bool,
    },

    /// Show the saved session
    Status,

    /// List archived sessions
    History,

    /// List the checkpoints of the saved session
    Checkpoints,

    /// Restore the working tree to a checkpoint
    Rollback {
        /// Checkpoint number or commit ref prefix
        reference: String,
    },

    /// Run the gate pipeline over the working tree
    Verify {
        /// Include advisory gates
        #[arg(long)]
        quality: bool,
    },

    /// Show the resolved project profile and its gates
    Profile,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = std::env::current_dir()?;

    cadence::log::init(cli.debug, Some(&root));
    clog!("cadence starting: {:?}", cli.command);

    match cli.command {
        Command::Run {
            plan,
            prompt,
            workers,
            trust,
            interactive,
            max_iterations,
        } => {
            let mut config = Config::load(&root)?;
            if let Some(n) = workers {
                config.worker_count = clamp_worker_count(n);
            }
            if let Some(n) = max_iterations {
                config.max_iterations = n;
            }
            config.trust |= trust;
            let saved = save_plan(&root, &plan)?;
            let prompt = prompt.unwrap_or_else(|| default_prompt(&plan));
            run_session(&root, config, &saved, interactive, Some(prompt))
        }
        Command::Resume {
            plan,
            trust,
            interactive,
        } => {
            let mut config = Config::load(&root)?;
            config.trust |= trust;
            let plan = plan.unwrap_or_else(|| saved_plan_path(&root));
            run_session(&root, config, &plan, interactive, None)
        }
        Command::Status => run_status(&root),
        Command::History => run_history(&root),
        Command::Checkpoints => run_checkpoints(&root),
        Command::Rollback { reference } => run_rollback(&root, &reference),
        Command::Verify { quality } => run_verify(&root, quality),
        Command::Profile => run_profile(&root),
    }
}

fn saved_plan_path(root: &Path) -> PathBuf {
    Config::project_dir(root).join(SAVED_PLAN)
}

fn save_plan(root: &Path, plan: &Path) -> Result<PathBuf> {
    let target = saved_plan_path(root);
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::copy(plan, &target).map_err(|e| {
        Error::Validation(format!("cannot read plan {}: {}", plan.display(), e))
    })?;
    Ok(target)
}

fn default_prompt(plan: &Path) -> String {
    let name = plan
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plan".to_string());
    format!("Carry out plan {}", name)
}

/// Build the orchestrator and drive a new or resumed session. Ctrl-C
/// pauses the session at the next safe point.
fn run_session(
    root: &Path,
    config: Config,
    plan: &Path,
    interactive: bool,
    prompt: Option<String>,
) -> Result<()> {
    let parts = Collaborators::from_config(root, &config, plan, interactive)?;
    let orchestrator = Orchestrator::new(root, config, parts);
    let cancel = orchestrator.cancel_token();

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                clog!("Interrupt received, pausing session");
                eprintln!("\nInterrupted: pausing at the next safe point...");
                cancel.cancel();
            }
        });
        match prompt {
            Some(prompt) => orchestrator.start(&prompt).await,
            None => orchestrator.resume().await,
        }
    })?;

    print_outcome(&outcome);
    if matches!(outcome.status, SessionStatus::Failed | SessionStatus::Aborted) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    println!("  Session:   {}", outcome.session_id.short());
    println!("  Status:    {}", format_status(outcome.status));
    println!("  Phase:     {}", outcome.phase);
    println!("  Iteration: {}", outcome.iteration);
    println!("  Summary:   {}", outcome.summary);
    if let Some(target) = &outcome.rollback {
        println!();
        println!("  Roll back to the last good state with: cadence rollback {}", target);
    }
    if outcome.status.is_resumable() {
        println!();
        println!("  Continue with: cadence resume");
    }
}

/// Format session status with color codes for terminal.
fn format_status(status: SessionStatus) -> String {
    match status {
        SessionStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        SessionStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        SessionStatus::Aborted => format!("\x1b[35m{}\x1b[0m", status),
        SessionStatus::Running => format!("\x1b[33m{}\x1b[0m", status),
        SessionStatus::Paused => format!("\x1b[34m{}\x1b[0m", status),
        SessionStatus::PendingApproval | SessionStatus::Blocked => {
            format!("\x1b[36m{}\x1b[0m", status)
        }
    }
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn run_status(root: &Path) -> Result<()> {
    let store = SessionStore::new(root);
    let session = match store.load() {
        Ok(session) => session,
        Err(Error::NoSession(_)) => {
            println!("No saved session.");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    println!();
    println!("  Session:     {}", session.id.short());
    println!("  Prompt:      {}", truncate_string(&session.prompt, 60));
    println!("  Status:      {}", format_status(session.status));
    println!("  Phase:       {}", session.phase());
    println!("  Iteration:   {}", session.iteration());
    println!("  Updated:     {}", session.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Checkpoints: {}", session.checkpoints.len());
    println!();
    println!("  Tasks ({}):", session.graph.len());
    for (label, count) in session.graph.status_counts() {
        println!("    {:<12} {}", label, count);
    }
    for task in session.graph.tasks() {
        println!("    {:<10} {:<3} {:<12} {}", task.id, task.priority, task.status.label(), task.title);
    }
    if let Some(question) = &session.pending_question {
        println!();
        println!("  Waiting on: {}", question.question);
        if !question.detail.is_empty() {
            println!("              {}", question.detail);
        }
        println!("  Options:    {}", question.options.join(" / "));
    }
    if let Some(error) = &session.last_error {
        println!();
        println!("  Last error: {}", error);
    }
    Ok(())
}

fn run_history(root: &Path) -> Result<()> {
    let entries = SessionStore::new(root).list_history()?;
    if entries.is_empty() {
        println!("No archived sessions.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {}  {:<10} {}/{} tasks  {} checkpoints  {}",
            entry.id.short(),
            entry.updated_at.format("%Y-%m-%d %H:%M"),
            entry.status,
            entry.completed,
            entry.tasks,
            entry.checkpoints,
            truncate_string(&entry.prompt, 40)
        );
    }
    Ok(())
}

fn run_checkpoints(root: &Path) -> Result<()> {
    let session = SessionStore::new(root).load()?;
    if session.checkpoints.is_empty() {
        println!("No checkpoints yet.");
        return Ok(());
    }
    for checkpoint in session.checkpoints.entries() {
        let tasks: Vec<String> = checkpoint.task_ids.iter().map(|t| t.to_string()).collect();
        println!(
            "#{:<3} {}  {}  [{}]{}",
            checkpoint.id,
            checkpoint.short_ref(),
            checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
            tasks.join(", "),
            if checkpoint.superseded { "  (superseded)" } else { "" }
        );
    }
    Ok(())
}

fn orchestrator_for(root: &Path) -> Result<Orchestrator> {
    let config = Config::load(root)?;
    let parts = Collaborators::from_config(root, &config, &saved_plan_path(root), false)?;
    Ok(Orchestrator::new(root, config, parts))
}

fn run_rollback(root: &Path, reference: &str) -> Result<()> {
    let orchestrator = orchestrator_for(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let checkpoint = rt.block_on(orchestrator.rollback(reference))?;
    println!(
        "Rolled back to checkpoint #{} ({})",
        checkpoint.id,
        checkpoint.short_ref()
    );
    Ok(())
}

fn run_verify(root: &Path, quality: bool) -> Result<()> {
    let orchestrator = orchestrator_for(root)?;
    let stage = if quality {
        PipelineStage::Quality
    } else {
        PipelineStage::Verify
    };
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(orchestrator.verify(stage))?;

    for gate in &report.gates {
        let mark = match gate.status {
            GateStatus::Passed => "\x1b[32mpass\x1b[0m",
            GateStatus::Failed => "\x1b[33mwarn\x1b[0m",
            GateStatus::Skipped => "\x1b[90mskip\x1b[0m",
            GateStatus::Unresolved => "\x1b[31mFAIL\x1b[0m",
        };
        let escalation = if gate.escalated {
            format!(", escalated ({} assisted)", gate.escalation_attempts)
        } else {
            String::new()
        };
        println!(
            "  {}  {:<14} attempts {}{}",
            mark, gate.name, gate.attempts, escalation
        );
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    let summary = report.summary();
    println!();
    println!(
        "  {} gates: {} passed, {} failed, {} skipped",
        summary.total, summary.passed, summary.failed, summary.skipped
    );

    match report.first_unresolved() {
        Some(gate) => {
            clog_warn!("verify: gate {} unresolved", gate.name);
            Err(Error::GateEscalated {
                gate: gate.name.clone(),
                attempts: gate.attempts + gate.escalation_attempts,
            })
        }
        None => Ok(()),
    }
}

fn run_profile(root: &Path) -> Result<()> {
    let config = Config::load(root)?;
    let profile = Profile::resolve(root, config.profile.as_deref())?;
    println!("Profile: {}", profile.name);
    if profile.gates.is_empty() {
        println!("  (no gates)");
    }
    for gate in &profile.gates {
        println!(
            "  {:<14} {:<9} {:<8} {}{}",
            gate.name,
            gate.category,
            if gate.blocking { "blocking" } else { "advisory" },
            gate.command,
            gate.fix_command
                .as_deref()
                .map(|f| format!("  (fix: {})", f))
                .unwrap_or_default()
        );
        if !gate.detect.applies(root) {
            println!("  {:<14} not applicable here", "");
        }
    }
    Ok(())
}
