//! `apf`: command surface over the approval runtime and its `SQLite` store.
//!
//! Every command prints JSON on stdout. Failures are rendered by
//! [`render_error`] as `{ "error": { code, category, retriable, message } }`
//! for stderr; logs go to stderr as well.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use approval_flow_core::{
    load_definition_from_path, parse_definition_yaml, parse_rfc3339_utc, validate_definition,
    DefinitionId, EngineConfig, EngineError, HistoryQuery, InstanceId, InstanceState,
    StaticDirectory,
};
use approval_flow_runtime::{
    static_adapters_from_json, ActionRequest, ApprovalRuntime, ExpirySweeper, ManualClock,
    StartRequest,
};
use approval_flow_store_sqlite::SqliteApprovalStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "apf")]
#[command(about = "Approval workflow engine CLI")]
pub struct Cli {
    #[arg(long, default_value = "./approval_flow.sqlite3")]
    db: PathBuf,

    /// Engine config JSON (`max_cas_attempts`, `sweep_batch_limit`, ...).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Entity snapshots: `{ entity_type: { entity_id: { field: value } } }`.
    #[arg(long)]
    entities: Option<PathBuf>,

    /// Approver directory: `{ "roles": {..}, "managers": {..} }`.
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Act as of this RFC3339 UTC instant instead of the system clock.
    #[arg(long)]
    now: Option<String>,

    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Definition {
        #[command(subcommand)]
        command: DefinitionCommand,
    },
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
    /// In-progress instances awaiting an identity.
    Inbox(InboxArgs),
    History(HistoryArgs),
    /// Expire every in-progress instance past its deadline.
    Sweep,
}

#[derive(Debug, Subcommand)]
pub enum DefinitionCommand {
    Register(DefinitionFileArgs),
    Validate(DefinitionFileArgs),
    List(DefinitionListArgs),
    Show(DefinitionIdArgs),
    Deactivate(DefinitionIdArgs),
}

#[derive(Debug, Args)]
pub struct DefinitionFileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct DefinitionListArgs {
    #[arg(long)]
    entity_type: Option<String>,
}

#[derive(Debug, Args)]
pub struct DefinitionIdArgs {
    #[arg(long)]
    definition_id: String,
}

#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    Start(StartArgs),
    Approve(ActionArgs),
    Reject(ActionArgs),
    Cancel(ActionArgs),
    Show(InstanceIdArgs),
    Events(InstanceIdArgs),
    Audit(InstanceIdArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    entity_id: String,
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Args)]
pub struct ActionArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    comment: Option<String>,
    /// Idempotency timestamp; repeating it replays the recorded outcome.
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct InstanceIdArgs {
    #[arg(long)]
    instance_id: String,
}

#[derive(Debug, Args)]
pub struct InboxArgs {
    #[arg(long)]
    identity: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long)]
    state: Option<StateArg>,
    /// Inclusive lower bound on completion (or start) time.
    #[arg(long)]
    from: Option<String>,
    /// Exclusive upper bound.
    #[arg(long)]
    to: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    /// 0 uses the configured default.
    #[arg(long, default_value_t = 0)]
    page_size: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum StateArg {
    InProgress,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl From<StateArg> for InstanceState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::InProgress => Self::InProgress,
            StateArg::Approved => Self::Approved,
            StateArg::Rejected => Self::Rejected,
            StateArg::Cancelled => Self::Cancelled,
            StateArg::Expired => Self::Expired,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub category: &'static str,
    pub retriable: bool,
    pub message: String,
}

impl ErrorEnvelope {
    /// Engine errors keep their own code; anything else (I/O, `SQLite`,
    /// JSON) is reported as `cli_error`.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let error = match err.downcast_ref::<EngineError>() {
            Some(engine) => ErrorPayload {
                code: engine.code(),
                category: engine.category().as_str(),
                retriable: engine.is_retriable(),
                message,
            },
            None => ErrorPayload {
                code: "cli_error",
                category: "configuration",
                retriable: false,
                message,
            },
        };
        Self { error }
    }
}

/// Single-line JSON error envelope for stderr.
#[must_use]
pub fn render_error(err: &anyhow::Error) -> String {
    let envelope = ErrorEnvelope::from_error(err);
    serde_json::to_string(&envelope).unwrap_or_else(|_| {
        format!(
            "{{\"error\":{{\"code\":\"{}\",\"message\":\"unrenderable error\"}}}}",
            envelope.error.code
        )
    })
}

/// Executes an already parsed command line.
///
/// # Errors
/// Returns an error when the store cannot be opened, an input file is
/// unreadable, or the engine refuses the command.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);

    if let Command::Definition {
        command: DefinitionCommand::Validate(args),
    } = &cli.command
    {
        return validate_file(&args.file);
    }

    let runtime = open_runtime(&cli)?;
    run_command(cli.command, runtime)
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Opens (and migrates) the store and wires adapters, directory, clock and
/// config from the global flags.
///
/// # Errors
/// Returns an error when the database or any referenced JSON file cannot be
/// loaded.
pub fn open_runtime(cli: &Cli) -> Result<ApprovalRuntime<SqliteApprovalStore>> {
    tracing::debug!(db = %cli.db.display(), "Opening approval store");
    let store = SqliteApprovalStore::open(&cli.db)?;
    store.migrate()?;

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json(&read_json(path)?)?,
        None => EngineConfig::default(),
    };
    let mut builder = ApprovalRuntime::builder(store).config(config);
    if let Some(path) = &cli.entities {
        for adapter in static_adapters_from_json(&read_json(path)?)? {
            builder = builder.adapter(adapter);
        }
    }
    if let Some(path) = &cli.directory {
        builder = builder.directory(StaticDirectory::from_json(&read_json(path)?)?);
    }
    if let Some(raw) = &cli.now {
        builder = builder.clock(ManualClock::new(parse_rfc3339_utc(raw)?));
    }
    Ok(builder.build()?)
}

/// Executes one command against a wired runtime.
///
/// # Errors
/// Returns the engine error that refused the command, or a storage failure.
pub fn run_command(command: Command, runtime: ApprovalRuntime<SqliteApprovalStore>) -> Result<()> {
    match command {
        Command::Definition { command } => match command {
            DefinitionCommand::Register(args) => {
                let draft = load_definition_from_path(&args.file)?;
                print_json(&runtime.register_definition(draft)?)
            }
            DefinitionCommand::Validate(args) => validate_file(&args.file),
            DefinitionCommand::List(args) => {
                print_json(&runtime.list_definitions(args.entity_type.as_deref())?)
            }
            DefinitionCommand::Show(args) => {
                print_json(&runtime.get_definition(parse_definition_id(&args.definition_id)?)?)
            }
            DefinitionCommand::Deactivate(args) => print_json(
                &runtime.deactivate_definition(parse_definition_id(&args.definition_id)?)?,
            ),
        },
        Command::Instance { command } => match command {
            InstanceCommand::Start(args) => print_json(&runtime.start_approval(&StartRequest::new(
                args.entity_type,
                args.entity_id,
                args.requester,
            ))?),
            InstanceCommand::Approve(args) => print_json(&runtime.approve(&action_request(args)?)?),
            InstanceCommand::Reject(args) => print_json(&runtime.reject(&action_request(args)?)?),
            InstanceCommand::Cancel(args) => print_json(&runtime.cancel(&action_request(args)?)?),
            InstanceCommand::Show(args) => {
                print_json(&runtime.get_instance(parse_instance_id(&args.instance_id)?)?)
            }
            InstanceCommand::Events(args) => {
                print_json(&runtime.history_events(parse_instance_id(&args.instance_id)?)?)
            }
            InstanceCommand::Audit(args) => {
                let instance_id = parse_instance_id(&args.instance_id)?;
                let report = runtime.audit(instance_id)?;
                print_json(&report)?;
                if report.consistent {
                    Ok(())
                } else {
                    Err(EngineError::HistoryCorrupted {
                        instance_id,
                        reason: report.issues.join("; "),
                    }
                    .into())
                }
            }
        },
        Command::Inbox(args) => print_json(&runtime.pending_for(&args.identity)?),
        Command::History(args) => {
            let query = HistoryQuery {
                entity_type: args.entity_type,
                state: args.state.map(InstanceState::from),
                from: args.from.as_deref().map(parse_rfc3339_utc).transpose()?,
                to: args.to.as_deref().map(parse_rfc3339_utc).transpose()?,
                page: args.page,
                page_size: args.page_size,
            };
            print_json(&runtime.query_history(&query)?)
        }
        Command::Sweep => {
            let runtime = Arc::new(runtime);
            let now = runtime.now();
            print_json(&ExpirySweeper::new(runtime).run_once(now)?)
        }
    }
}

fn validate_file(path: &Path) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read definition {}", path.display()))?;
    let draft = parse_definition_yaml(&content)?;
    let report = validate_definition(&draft);
    print_json(&report)?;
    report.into_result().map(|_| ()).map_err(Into::into)
}

fn action_request(args: ActionArgs) -> Result<ActionRequest> {
    let mut request = ActionRequest::new(parse_instance_id(&args.instance_id)?, args.actor);
    if let Some(comment) = args.comment {
        request = request.with_comment(comment);
    }
    if let Some(raw) = args.occurred_at.as_deref() {
        request = request.at(parse_rfc3339_utc(raw)?);
    }
    Ok(request)
}

fn parse_instance_id(raw: &str) -> Result<InstanceId> {
    InstanceId::from_str(raw).map_err(|err| {
        EngineError::Configuration(format!("invalid instance id {raw:?}: {err}")).into()
    })
}

fn parse_definition_id(raw: &str) -> Result<DefinitionId> {
    DefinitionId::from_str(raw).map_err(|err| {
        EngineError::Configuration(format!("invalid definition id {raw:?}: {err}")).into()
    })
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_keep_their_code_in_the_envelope() {
        let err = anyhow::Error::from(EngineError::NoApplicableWorkflow {
            entity_type: "purchase_order".to_string(),
        })
        .context("starting approval");
        let envelope = ErrorEnvelope::from_error(&err);
        assert_eq!(envelope.error.code, "no_applicable_workflow");
        assert_eq!(envelope.error.category, "request");
        assert!(!envelope.error.retriable);
        assert!(envelope.error.message.contains("purchase_order"));

        let other = anyhow::anyhow!("disk on fire");
        assert_eq!(ErrorEnvelope::from_error(&other).error.code, "cli_error");
    }

    #[test]
    fn command_line_parses_global_flags_before_subcommand() {
        let parsed = Cli::try_parse_from([
            "apf",
            "--db",
            "/tmp/x.sqlite3",
            "--now",
            "2026-03-02T09:00:00Z",
            "history",
            "--state",
            "in_progress",
            "--page-size",
            "10",
        ]);
        let cli = match parsed {
            Ok(cli) => cli,
            Err(err) => panic!("command line must parse: {err}"),
        };
        assert_eq!(cli.db, PathBuf::from("/tmp/x.sqlite3"));
        assert!(matches!(
            cli.command,
            Command::History(HistoryArgs {
                state: Some(StateArg::InProgress),
                page_size: 10,
                ..
            })
        ));
    }
}
