use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use estate_state_api::{EngineConfig, StateEngine};
use estate_state_core::{AuditQuery, Customer, RecordId, SettingsPatch, StateError, Unit};
use estate_state_store_sqlite::{
    LegacyBlobFile, LegacySource, SqliteKvStore, StorageError, DEFAULT_LEGACY_KEY,
};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

type Engine = StateEngine<SqliteKvStore>;

#[derive(Debug, Parser)]
#[command(name = "estate")]
#[command(about = "Estate back-office state CLI")]
struct Cli {
    #[arg(long, env = "ESTATE_DB", default_value = "./estate_state.sqlite3")]
    db: PathBuf,

    /// JSON file holding the legacy blob; defaults to the database's `legacy_store` table.
    #[arg(long, env = "ESTATE_LEGACY_FILE")]
    legacy_file: Option<PathBuf>,

    #[arg(long, default_value_t = estate_state_core::DEFAULT_HISTORY_CAPACITY)]
    history_capacity: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Customer {
        #[command(subcommand)]
        command: CustomerCommand,
    },
    Unit {
        #[command(subcommand)]
        command: UnitCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Status,
    Health,
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CustomerCommand {
    Add(CustomerAddArgs),
    List,
    Delete(DeleteArgs),
}

#[derive(Debug, Args)]
struct CustomerAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    phone: String,
    #[arg(long)]
    national_id: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum UnitCommand {
    Add(UnitAddArgs),
    List,
}

#[derive(Debug, Args)]
struct UnitAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    code: String,
    #[arg(long)]
    building: Option<String>,
    #[arg(long)]
    floor: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List(AuditListArgs),
    Clear,
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long, value_parser = parse_rfc3339)]
    from: Option<OffsetDateTime>,
    #[arg(long, value_parser = parse_rfc3339)]
    to: Option<OffsetDateTime>,
    #[arg(long)]
    text: Option<String>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
    /// Set the lock password; omit `--value` to remove it.
    Password(PasswordArgs),
    Lock,
    Unlock(UnlockArgs),
}

#[derive(Debug, Args)]
struct SettingsSetArgs {
    #[arg(long)]
    theme: Option<String>,
    #[arg(long)]
    font_size: Option<u32>,
}

#[derive(Debug, Args)]
struct PasswordArgs {
    #[arg(long)]
    value: Option<String>,
}

#[derive(Debug, Args)]
struct UnlockArgs {
    #[arg(long)]
    password: Option<String>,
}

/// Legacy blob from an explicit file or from the database itself.
enum CliLegacySource {
    File(LegacyBlobFile),
    Table(SqliteKvStore),
}

impl LegacySource for CliLegacySource {
    async fn read_blob(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self {
            Self::File(file) => file.read_blob(key).await,
            Self::Table(kv) => kv.read_blob(key).await,
        }
    }
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("invalid RFC 3339 timestamp: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ESTATE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn start_engine(cli: &Cli) -> Result<Engine> {
    let kv = SqliteKvStore::open(&cli.db)
        .with_context(|| format!("failed to open state database at {}", cli.db.display()))?;
    let legacy = match &cli.legacy_file {
        Some(path) => CliLegacySource::File(LegacyBlobFile::new(path)),
        None => CliLegacySource::Table(kv.clone()),
    };
    let config = EngineConfig {
        history_capacity: cli.history_capacity,
        legacy_key: DEFAULT_LEGACY_KEY.to_string(),
        ..EngineConfig::default()
    };
    let engine = StateEngine::start(config, kv, &legacy).await?;
    if let Some(err) = engine.migration_error() {
        tracing::warn!(error = %err, "{}", err.notification());
    }
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut engine = start_engine(&cli).await?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut engine).await,
        Command::Customer { command } => run_customer(command, &mut engine).await,
        Command::Unit { command } => run_unit(command, &mut engine).await,
        Command::Audit { command } => run_audit(command, &mut engine).await,
        Command::Settings { command } => run_settings(command, &mut engine).await,
    }
}

async fn run_db(command: DbCommand, engine: &mut Engine) -> Result<()> {
    match command {
        DbCommand::Status => {
            let status = engine.status().await?;
            emit_json(serde_json::to_value(status)?)
        }
        DbCommand::Health => {
            let report = engine.health().await?;
            emit_json(serde_json::to_value(report)?)
        }
        DbCommand::Export(args) => {
            let exported = engine.export_all()?;
            fs::write(&args.out, serde_json::to_string_pretty(&exported)?)
                .with_context(|| format!("failed to write export to {}", args.out.display()))?;
            emit_json(json!({
                "out": args.out.display().to_string(),
                "records": engine.store().total_records()
            }))
        }
        DbCommand::Import(args) => {
            let body = fs::read_to_string(&args.input)
                .with_context(|| format!("failed to read {}", args.input.display()))?;
            let Value::Object(object) = serde_json::from_str::<Value>(&body)
                .with_context(|| format!("{} is not valid JSON", args.input.display()))?
            else {
                return Err(anyhow!("{} must contain a JSON object", args.input.display()));
            };
            let records = engine.import_all(&object).await?;
            emit_json(json!({ "imported_records": records }))
        }
        DbCommand::Backup(args) => {
            engine
                .backend()
                .backup_to(args.out.clone())
                .await
                .with_context(|| format!("failed to back up to {}", args.out.display()))?;
            emit_json(json!({ "out": args.out.display().to_string() }))
        }
    }
}

async fn run_customer(command: CustomerCommand, engine: &mut Engine) -> Result<()> {
    match command {
        CustomerCommand::Add(args) => {
            let name = args.name.trim().to_string();
            if name.is_empty() {
                return Err(anyhow!("customer name must not be empty"));
            }
            let mut customer = Customer::new(name.clone());
            customer.phone = Some(args.phone);
            customer.national_id = args.national_id;
            customer.address = args.address;
            customer.status = args.status;
            customer.notes = args.notes;
            let record = serde_json::to_value(&customer)?;

            let id = engine
                .apply_logged(format!("Added customer {name}"), record.clone(), move |store| {
                    let wanted = name.to_lowercase();
                    let taken = store
                        .collection::<Customer>()
                        .iter()
                        .any(|existing| existing.name.trim().to_lowercase() == wanted);
                    if taken {
                        return Err(StateError::Rejected(format!(
                            "a customer named {name} already exists"
                        )));
                    }
                    store.insert(customer)
                })
                .await?;
            emit_json(json!({ "id": id, "customer": record }))
        }
        CustomerCommand::List => {
            let customers = serde_json::to_value(engine.store().collection::<Customer>())?;
            emit_json(json!({ "customers": customers }))
        }
        CustomerCommand::Delete(args) => {
            let id = RecordId::from(args.id);
            let removed = engine
                .apply_mutation(move |store| {
                    let removed = store.remove::<Customer>(&id)?;
                    store.audit_mut().append(
                        format!("Deleted customer {}", removed.name),
                        json!({ "id": removed.id }),
                    )?;
                    Ok(removed)
                })
                .await?;
            emit_json(json!({ "deleted": removed.id, "name": removed.name }))
        }
    }
}

async fn run_unit(command: UnitCommand, engine: &mut Engine) -> Result<()> {
    match command {
        UnitCommand::Add(args) => {
            let code = args.code.trim().to_string();
            let mut unit = Unit::new(args.name.trim());
            unit.code = Some(code.clone());
            unit.building = args.building;
            unit.floor = args.floor;
            unit.notes = args.notes;
            let record = serde_json::to_value(&unit)?;

            let id = engine
                .apply_logged(format!("Added unit {code}"), record.clone(), move |store| {
                    let taken = store.collection::<Unit>().iter().any(|existing| {
                        existing.code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(&code))
                    });
                    if taken {
                        return Err(StateError::Rejected(format!(
                            "a unit with code {code} already exists"
                        )));
                    }
                    store.insert(unit)
                })
                .await?;
            emit_json(json!({ "id": id, "unit": record }))
        }
        UnitCommand::List => {
            let units = serde_json::to_value(engine.store().collection::<Unit>())?;
            emit_json(json!({ "units": units }))
        }
    }
}

async fn run_audit(command: AuditCommand, engine: &mut Engine) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let query = AuditQuery {
                from: args.from,
                to: args.to,
                text: args.text,
                offset: args.offset,
                limit: args.limit,
            };
            let entries = engine.audit_query(&query);
            emit_json(json!({ "count": entries.len(), "entries": entries }))
        }
        AuditCommand::Clear => {
            let removed = engine.clear_audit().await?;
            emit_json(json!({ "removed": removed }))
        }
    }
}

async fn run_settings(command: SettingsCommand, engine: &mut Engine) -> Result<()> {
    match command {
        SettingsCommand::Show => {}
        SettingsCommand::Set(args) => {
            engine
                .update_settings(SettingsPatch {
                    theme: args.theme,
                    font_size: args.font_size,
                    password: None,
                })
                .await?;
        }
        SettingsCommand::Password(args) => {
            engine
                .update_settings(SettingsPatch {
                    password: Some(args.value),
                    ..SettingsPatch::default()
                })
                .await?;
        }
        SettingsCommand::Lock => engine.lock().await?,
        SettingsCommand::Unlock(args) => engine.unlock(args.password.as_deref()).await?,
    }
    let store = engine.store();
    emit_json(json!({
        "settings": store.settings(),
        "locked": store.locked(),
        "password_set": store.settings().password_hash.is_some()
    }))
}
