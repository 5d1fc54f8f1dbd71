use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cask_core::scanner::{self, ScanFilter};
use cask_core::{
    store_error, AttemptPhase, Config, Identity, Metadata, MigrateOptions, MigrationPolicy,
    ObjectStore, ResultStatus, SchemaVersion, StoreConfig, View,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::debug;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = CaskCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let outcome = run(&cli);
    let code = emit(&cli, outcome);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserError => 1,
            Self::Failure => 2,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UserError => "user-error",
            Self::Failure => "error",
        }
    }
}

struct Outcome {
    message: String,
    details: Value,
}

impl Outcome {
    fn new(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }
}

fn emit(cli: &CaskCli, outcome: Result<Outcome>) -> i32 {
    let (status, message, details) = match outcome {
        Ok(outcome) => (CommandStatus::Ok, outcome.message, outcome.details),
        Err(err) => match store_error(&err) {
            Some(store) => (
                CommandStatus::UserError,
                format!("{err:#}"),
                json!({ "code": store.code() }),
            ),
            None => (CommandStatus::Failure, format!("{err:#}"), json!({})),
        },
    };

    if cli.json {
        let envelope = json!({
            "status": status.label(),
            "message": message,
            "details": details,
        });
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("failed to encode response: {err}"),
        }
    } else if status == CommandStatus::Ok {
        if !cli.quiet {
            println!("{message}");
        }
    } else {
        eprintln!("cask: {message}");
    }
    status.exit_code()
}

fn run(cli: &CaskCli) -> Result<Outcome> {
    let store = open_store(cli.root.as_ref())?;
    debug!(root = %store.root().display(), "opened store");
    match &cli.command {
        CommandGroup::List(args) => list(&store, args),
        CommandGroup::Show(args) => show(&store, args),
        CommandGroup::Stats => stats(&store),
        CommandGroup::Exists(target) => exists(&store, target),
        CommandGroup::Path(target) => path(&store, target),
        CommandGroup::Migrate(args) => migrate(&store, args),
        CommandGroup::Invalidate(args) => invalidate(&store, args),
    }
}

fn open_store(root: Option<&PathBuf>) -> Result<ObjectStore> {
    match root {
        Some(root) => {
            let mut config = StoreConfig::from_env()?;
            config.root.clone_from(root);
            Ok(ObjectStore::new(config))
        }
        None => ObjectStore::from_env(),
    }
}

fn list(store: &ObjectStore, args: &ListArgs) -> Result<Outcome> {
    let filter = ScanFilter {
        result_status: args.status,
        attempt_phase: args.phase,
        namespace_prefix: args.namespace.clone(),
    };
    let objects = scanner::scan(store.root(), &filter, args.view)?;
    let mut lines = Vec::with_capacity(objects.len() + 1);
    lines.push(format!("{} object(s) ({} view)", objects.len(), args.view));
    for object in &objects {
        let phase = object
            .attempt_phase
            .map(|phase| format!(" [{phase}]"))
            .unwrap_or_default();
        let link = if object.link == "plain" {
            String::new()
        } else {
            format!(" ({} alias)", object.link)
        };
        lines.push(format!(
            "  {:<8} {}:{}{phase}{link}",
            object.result_status.as_str(),
            object.namespace,
            object.hash
        ));
    }
    Ok(Outcome::new(
        lines.join("\n"),
        json!({ "view": args.view, "objects": objects }),
    ))
}

fn show(store: &ObjectStore, args: &ShowArgs) -> Result<Outcome> {
    let identity = args.target.identity();
    let Some(detail) = scanner::detail(store.root(), &identity, args.view)? else {
        bail!(
            "no object stored for {identity} under {}",
            store.root().display()
        );
    };
    let mut lines = vec![
        format!("{identity}"),
        format!("  directory: {}", detail.directory.display()),
        format!("  status:    {}", detail.state.status()),
        format!("  link:      {}", detail.link),
    ];
    if detail.effective_directory != detail.directory {
        lines.push(format!(
            "  resolved:  {}",
            detail.effective_directory.display()
        ));
    }
    if let Some(error) = &detail.state.result.error {
        lines.push(format!("  error:     {}: {}", error.kind, error.message));
    }
    lines.push(format!("  events:    {}", detail.events.len()));
    Ok(Outcome::new(lines.join("\n"), serde_json::to_value(&detail)?))
}

fn stats(store: &ObjectStore) -> Result<Outcome> {
    let totals = scanner::stats(store.root())?;
    let message = format!(
        "{} object(s): {} success, {} failed, {} running, {} queued, \
         {} active alias(es), {} detached",
        totals.total,
        totals.success,
        totals.failed,
        totals.running,
        totals.queued,
        totals.active_aliases,
        totals.detached_aliases,
    );
    Ok(Outcome::new(message, serde_json::to_value(&totals)?))
}

fn exists(store: &ObjectStore, target: &Target) -> Result<Outcome> {
    let identity = target.identity();
    let resolution = store.resolve(&identity)?;
    let present = resolution.exists();
    let message = if present {
        format!("{identity} is available")
    } else {
        format!("{identity} is not available ({})", resolution.status)
    };
    Ok(Outcome::new(
        message,
        json!({
            "exists": present,
            "status": resolution.status,
            "effective_status": resolution.effective_status,
            "link": resolution.link.label(),
        }),
    ))
}

fn path(store: &ObjectStore, target: &Target) -> Result<Outcome> {
    let identity = target.identity();
    let resolution = store.resolve(&identity)?;
    Ok(Outcome::new(
        resolution.effective.display().to_string(),
        json!({
            "directory": resolution.requested,
            "effective_directory": resolution.effective,
            "link": resolution.link.label(),
        }),
    ))
}

fn migrate(store: &ObjectStore, args: &MigrateArgs) -> Result<Outcome> {
    let from = args.from.identity();
    let source = store
        .metadata(&from)?
        .with_context(|| format!("no metadata stored for {from}"))?;
    let mut config: Config = source.config.clone();
    for (key, value) in &args.set {
        config.insert(key.clone(), value.clone());
    }
    let version = args.to_version.unwrap_or(source.version);
    let to = Metadata::new(&args.to_namespace, config, version);
    let options = MigrateOptions {
        origin: args.origin.clone(),
        note: args.note.clone(),
        overwrite: args.overwrite,
    };
    let report = store.migrate(&from, &to, args.policy, &options)?;
    let verb = if report.resumed { "resumed" } else { "applied" };
    let message = format!("{verb} {} {from} -> {}", args.policy, to.identity());
    Ok(Outcome::new(message, serde_json::to_value(&report)?))
}

fn invalidate(store: &ObjectStore, args: &InvalidateArgs) -> Result<Outcome> {
    let identity = args.target.identity();
    let previous = store.invalidate(&identity, &args.reason)?;
    Ok(Outcome::new(
        format!("invalidated {identity} (was {previous})"),
        json!({ "previous_status": previous, "status": ResultStatus::Failed }),
    ))
}

const LOG_TARGETS: [&str; 4] = ["cask", "cask_cli", "cask_core", "cask_domain"];

fn log_filter(trace: bool, verbose: u8) -> String {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn init_tracing(trace: bool, verbose: u8) {
    let filter = log_filter(trace, verbose);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_status(value: &str) -> Result<ResultStatus, String> {
    ResultStatus::parse(value).ok_or_else(|| {
        format!("unknown status '{value}' (expected none, pending, success, failed, migrated)")
    })
}

fn parse_phase(value: &str) -> Result<AttemptPhase, String> {
    match value {
        "queued" => Ok(AttemptPhase::Queued),
        "running" => Ok(AttemptPhase::Running),
        other => Err(format!(
            "unknown attempt phase '{other}' (expected queued or running)"
        )),
    }
}

/// `key=value` where the value is read as JSON and falls back to a string.
fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty field name in '{raw}'"));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[derive(Parser, Debug)]
#[command(
    name = "cask",
    version,
    about = "Inspect and maintain a content-addressed object store",
    after_help = "Exit codes: 0 ok, 1 store refused the request, 2 unexpected failure."
)]
struct CaskCli {
    #[arg(short, long, global = true, help = "Suppress human output")]
    quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        global = true,
        help = "Increase logging (-v debug, -vv trace)"
    )]
    verbose: u8,
    #[arg(long, global = true, help = "Trace-level logging")]
    trace: bool,
    #[arg(long, global = true, help = "Emit a JSON envelope on stdout")]
    json: bool,
    #[arg(
        long,
        global = true,
        env = "CASK_PATH",
        value_name = "DIR",
        help = "Storage root"
    )]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: CommandGroup,
}

#[derive(Subcommand, Debug)]
enum CommandGroup {
    #[command(about = "List stored objects, newest first")]
    List(ListArgs),
    #[command(about = "Show state, metadata, link and events of one object")]
    Show(ShowArgs),
    #[command(about = "Count objects by status, phase and link state")]
    Stats,
    #[command(about = "Report whether an object has a usable result")]
    Exists(Target),
    #[command(about = "Print the directory an object is read from")]
    Path(Target),
    #[command(about = "Alias, move or copy an object to a new identity")]
    Migrate(MigrateArgs),
    #[command(about = "Mark an object failed so it is recomputed")]
    Invalidate(InvalidateArgs),
}

#[derive(Args, Debug, Clone)]
struct Target {
    #[arg(value_name = "NAMESPACE")]
    namespace: String,
    #[arg(value_name = "HASH")]
    hash: String,
    #[arg(long, value_name = "VERSION")]
    schema_version: Option<SchemaVersion>,
}

impl Target {
    fn identity(&self) -> Identity {
        let identity = Identity::new(&self.namespace, &self.hash);
        match self.schema_version {
            Some(version) => identity.with_version(version),
            None => identity,
        }
    }
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long, value_parser = parse_status)]
    status: Option<ResultStatus>,
    #[arg(long, value_parser = parse_phase)]
    phase: Option<AttemptPhase>,
    #[arg(long, value_name = "PREFIX", help = "Only namespaces starting with PREFIX")]
    namespace: Option<String>,
    #[arg(long, default_value_t = View::Resolved)]
    view: View,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[command(flatten)]
    target: Target,
    #[arg(long, default_value_t = View::Resolved)]
    view: View,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    #[command(flatten)]
    from: Target,
    #[arg(value_name = "TO_NAMESPACE")]
    to_namespace: String,
    #[arg(long, default_value_t = MigrationPolicy::Alias)]
    policy: MigrationPolicy,
    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        value_parser = parse_field,
        help = "Override a config field of the destination"
    )]
    set: Vec<(String, Value)>,
    #[arg(long, value_name = "VERSION")]
    to_version: Option<SchemaVersion>,
    #[arg(long)]
    origin: Option<String>,
    #[arg(long)]
    note: Option<String>,
    #[arg(long, help = "Replace an existing result or alias at the destination")]
    overwrite: bool,
}

#[derive(Args, Debug)]
struct InvalidateArgs {
    #[command(flatten)]
    target: Target,
    #[arg(long, default_value = "manual")]
    reason: String,
}
