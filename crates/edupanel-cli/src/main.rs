//! edupanel: command-line driver for the content workflows.
//!
//! Every command prints its outcome as pretty JSON on stdout. Logs go to
//! stderr (or `LOG_FILE`).
//!
//! Exit codes: `0` success, `1` failure, `2` partial success, `3` failed
//! compensation (manual cleanup required).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use edupanel_core::defaults::{ATTACHMENT_ROOT, DATABASE_URL, PAGE_LIMIT, PAGE_OFFSET};
use edupanel_core::{
    detect_content_type, sanitize_filename, AttachmentFile, AttachmentStore, ListRecordsRequest,
    NewRecord, RecordKind, RecordPatch, RecordStore,
};
use edupanel_db::{Database, FilesystemAttachmentStore, PoolConfig};
use edupanel_saga::{
    group_by_name, paginate_groups, AttachmentSaga, BatchCoordinator, BatchResult, CancelSignal,
    DeletionGuard, SagaConfig, SagaError, SagaOutcome,
};

const EXIT_PARTIAL: u8 = 2;
const EXIT_COMPENSATION: u8 = 3;

#[derive(Parser)]
#[command(name = "edupanel")]
#[command(author, version, about = "Content administration workflows for edupanel")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL URL (default: $DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Attachment directory (default: $ATTACHMENT_ROOT)
    #[arg(long, global = true)]
    attachment_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a record, optionally with an attachment
    Create {
        #[arg(short, long)]
        kind: RecordKind,

        #[arg(short, long)]
        name: String,

        /// Parent record id
        #[arg(short, long)]
        parent: Option<Uuid>,

        /// Kind-specific fields as a JSON object
        #[arg(short, long)]
        fields: Option<String>,

        /// File to attach
        #[arg(long)]
        file: Option<PathBuf>,

        /// Attachment slot (default: the kind's first slot)
        #[arg(long)]
        subtype: Option<String>,
    },

    /// Update a record's fields and optionally swap its attachment
    Update {
        #[arg(short, long)]
        kind: RecordKind,

        #[arg(long)]
        id: Uuid,

        #[arg(short, long)]
        name: Option<String>,

        /// New parent record id
        #[arg(short, long, conflicts_with = "clear_parent")]
        parent: Option<Uuid>,

        /// Remove the parent
        #[arg(long)]
        clear_parent: bool,

        /// Fields to set, as a JSON object
        #[arg(short, long)]
        fields: Option<String>,

        /// Field to remove (repeatable)
        #[arg(long)]
        remove: Vec<String>,

        /// Replacement attachment
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        subtype: Option<String>,
    },

    /// Replace a record's attachment, leaving its fields unchanged
    Attach {
        #[arg(short, long)]
        kind: RecordKind,

        #[arg(long)]
        id: Uuid,

        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        subtype: Option<String>,
    },

    /// Delete a record that has no dependents
    Delete {
        #[arg(long)]
        id: Uuid,
    },

    /// Delete every record of a kind sharing a name
    DeleteGroup {
        #[arg(short, long)]
        kind: RecordKind,

        #[arg(short, long)]
        name: String,
    },

    /// Create one record per parent from shared fields
    Associate {
        #[arg(short, long)]
        kind: RecordKind,

        #[arg(short, long)]
        name: String,

        /// Parent record ids
        #[arg(short, long, required = true, num_args = 1..)]
        parent: Vec<Uuid>,

        #[arg(short, long)]
        fields: Option<String>,
    },

    /// List records of a kind grouped by name
    Groups {
        #[arg(short, long)]
        kind: RecordKind,

        #[arg(long, default_value_t = PAGE_LIMIT)]
        limit: usize,

        #[arg(long, default_value_t = PAGE_OFFSET)]
        offset: usize,
    },

    /// Apply database migrations
    Migrate,
}

/// Stores and configuration shared by the commands.
struct App {
    records: Arc<dyn RecordStore>,
    attachments: Arc<dyn AttachmentStore>,
    config: SagaConfig,
}

impl App {
    async fn connect(db: &Database, attachment_root: PathBuf) -> anyhow::Result<Self> {
        let attachments = FilesystemAttachmentStore::new(attachment_root);
        attachments
            .validate()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "attachment store at {} is not usable: {}",
                    attachments.base_path().display(),
                    e
                )
            })?;

        Ok(Self {
            records: Arc::new(db.records.clone()),
            attachments: Arc::new(attachments),
            config: SagaConfig::from_env(),
        })
    }

    fn saga(&self, kind: RecordKind, subtype: Option<&str>) -> anyhow::Result<AttachmentSaga> {
        let saga = AttachmentSaga::new(self.records.clone(), self.attachments.clone(), kind)
            .with_config(self.config.clone());
        match subtype {
            Some(subtype) => Ok(saga.with_subtype(subtype)?),
            None => Ok(saga),
        }
    }

    fn guard(&self) -> DeletionGuard {
        DeletionGuard::new(self.records.clone(), self.attachments.clone())
            .with_config(self.config.clone())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter
///                 (default: "edupanel_cli=info,edupanel_saga=info,edupanel_db=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edupanel_cli=info,edupanel_saga=info,edupanel_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("edupanel.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // stdout carries the JSON results
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| DATABASE_URL.to_string());
    let attachment_root = cli
        .attachment_root
        .or_else(|| std::env::var("ATTACHMENT_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(ATTACHMENT_ROOT));

    let db = Database::connect_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("connecting to database")?;

    match cli.command {
        Commands::Migrate => {
            db.migrate().await.context("applying migrations")?;
            info!("Migrations applied");
            print_json(&serde_json::json!({"status": "migrated"}))?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let app = App::connect(&db, attachment_root).await?;
            run_workflow(&app, command).await
        }
    }
}

async fn run_workflow(app: &App, command: Commands) -> anyhow::Result<ExitCode> {
    let cancel = CancelSignal::never();

    match command {
        Commands::Create {
            kind,
            name,
            parent,
            fields,
            file,
            subtype,
        } => {
            let mut new = NewRecord::new(kind, name);
            new.parent_id = parent;
            new.fields = parse_fields(fields.as_deref())?;
            let file = match file {
                Some(path) => Some(read_attachment(&path).await?),
                None => None,
            };
            let outcome = app
                .saga(kind, subtype.as_deref())?
                .create_with_attachment(new, file, &cancel)
                .await;
            report_outcome(&outcome)
        }
        Commands::Update {
            kind,
            id,
            name,
            parent,
            clear_parent,
            fields,
            remove,
            file,
            subtype,
        } => {
            let mut patch = RecordPatch::new();
            if let Some(name) = name {
                patch = patch.name(name);
            }
            if clear_parent {
                patch = patch.parent(None);
            } else if parent.is_some() {
                patch = patch.parent(parent);
            }
            for (key, value) in parse_fields(fields.as_deref())? {
                patch = patch.set_field(key, value);
            }
            for key in remove {
                patch = patch.remove_field(key);
            }
            let file = match file {
                Some(path) => Some(read_attachment(&path).await?),
                None => None,
            };
            let outcome = app
                .saga(kind, subtype.as_deref())?
                .update_with_attachment(id, patch, file, &cancel)
                .await;
            report_outcome(&outcome)
        }
        Commands::Attach {
            kind,
            id,
            file,
            subtype,
        } => {
            let file = read_attachment(&file).await?;
            let outcome = app
                .saga(kind, subtype.as_deref())?
                .replace_attachment(id, file, &cancel)
                .await;
            report_outcome(&outcome)
        }
        Commands::Delete { id } => match app.guard().delete_protected(id).await {
            Ok(deleted) => {
                print_json(&deleted)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(error) => {
                print_json(&error)?;
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::DeleteGroup { kind, name } => {
            match app.guard().delete_group(kind, &name, &cancel).await {
                Ok(result) => report_batch(&result),
                Err(error) => {
                    print_json(&error)?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Associate {
            kind,
            name,
            parent,
            fields,
        } => {
            let mut base = NewRecord::new(kind, name);
            base.fields = parse_fields(fields.as_deref())?;
            let result = BatchCoordinator::new(app.saga(kind, None)?)
                .associate_many(&base, &parent, &cancel)
                .await;
            report_batch(&result)
        }
        Commands::Groups {
            kind,
            limit,
            offset,
        } => {
            let records = app
                .records
                .list(ListRecordsRequest::of_kind(kind))
                .await
                .context("listing records")?;
            print_json(&paginate_groups(group_by_name(records), limit, offset))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => bail!("migrate does not run a workflow"),
    }
}

fn parse_fields(raw: Option<&str>) -> anyhow::Result<JsonMap<String, JsonValue>> {
    let Some(raw) = raw else {
        return Ok(JsonMap::new());
    };
    match serde_json::from_str::<JsonValue>(raw).context("parsing --fields")? {
        JsonValue::Object(map) => Ok(map),
        other => bail!("--fields must be a JSON object, got {}", other),
    }
}

async fn read_attachment(path: &Path) -> anyhow::Result<AttachmentFile> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let raw_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("attachment");
    let filename = sanitize_filename(raw_name);
    let content_type = detect_content_type(&filename, &data, "application/octet-stream");
    Ok(AttachmentFile::new(filename, content_type, data))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn outcome_code(outcome: &SagaOutcome) -> u8 {
    match outcome {
        SagaOutcome::Success { .. } => 0,
        SagaOutcome::PartialSuccess { .. } => EXIT_PARTIAL,
        SagaOutcome::Failed { error, .. } if error.is_compensation_failure() => EXIT_COMPENSATION,
        SagaOutcome::Failed { .. } => 1,
    }
}

fn batch_code<T>(result: &BatchResult<T>) -> u8 {
    if result
        .failed
        .iter()
        .any(|f| f.error.is_compensation_failure())
    {
        EXIT_COMPENSATION
    } else if result.failed.is_empty() {
        0
    } else {
        1
    }
}

fn report_outcome(outcome: &SagaOutcome) -> anyhow::Result<ExitCode> {
    print_json(outcome)?;
    Ok(ExitCode::from(outcome_code(outcome)))
}

fn report_batch<T: Serialize>(result: &BatchResult<T>) -> anyhow::Result<ExitCode> {
    print_json(result)?;
    Ok(ExitCode::from(batch_code(result)))
}
