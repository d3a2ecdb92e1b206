use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metadata_overlay_core::{
    EntryId, EntryScope, KeyRef, MetadataEntry, MetadataValue, PackageAttachment, QueryType,
    Resolver, ResolverConfig, SubjectRef, ValueKind,
};
use metadata_overlay_store_sqlite::{parse_entry_id, parse_rfc3339, SqliteStore};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mo")]
struct Cli {
    #[arg(long, default_value = "./metadata_overlay.sqlite3")]
    db: PathBuf,
    /// YAML resolver configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Key {
        #[command(subcommand)]
        command: Box<KeyCommand>,
    },
    Strand {
        #[command(subcommand)]
        command: Box<StrandCommand>,
    },
    Entry {
        #[command(subcommand)]
        command: Box<EntryCommand>,
    },
    Subject {
        #[command(subcommand)]
        command: Box<SubjectCommand>,
    },
    Package {
        #[command(subcommand)]
        command: Box<PackageCommand>,
    },
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
    View {
        #[command(subcommand)]
        command: Box<ViewCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    PurgeCache(DbPurgeCacheArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbPurgeCacheArgs {
    /// Drop live rows as well as expired ones.
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    Add(KeyAddArgs),
    List,
}

#[derive(Debug, Args)]
struct KeyAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value_t = false)]
    allow_multiple: bool,
    #[arg(long, default_value_t = 0)]
    cache_seconds: u32,
}

#[derive(Debug, Subcommand)]
enum StrandCommand {
    Declare(StrandDeclareArgs),
    List(StrandListArgs),
}

#[derive(Debug, Args)]
struct StrandDeclareArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    strand: String,
    #[arg(long, value_enum, default_value_t = ValueKindArg::Text)]
    value_kind: ValueKindArg,
}

#[derive(Debug, Args)]
struct StrandListArgs {
    #[arg(long)]
    kind: String,
}

#[derive(Debug, Subcommand)]
enum EntryCommand {
    Add(EntryAddArgs),
    Approve(EntryApproveArgs),
    List(ScopeArgs),
}

/// Either one subject or the defaults of a subject kind.
#[derive(Debug, Args)]
struct ScopeArgs {
    /// Owning subject as `kind:id`.
    #[arg(long, conflicts_with = "default_kind", required_unless_present = "default_kind")]
    subject: Option<String>,
    /// Subject kind whose defaults are targeted.
    #[arg(long)]
    default_kind: Option<String>,
}

#[derive(Debug, Args)]
struct EntryAddArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    strand: String,
    #[arg(long)]
    key: String,
    #[arg(long)]
    value: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    creator: String,
    /// Approve on write.
    #[arg(long)]
    approver: Option<String>,
}

#[derive(Debug, Args)]
struct EntryApproveArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    approver: String,
}

#[derive(Debug, Subcommand)]
enum SubjectCommand {
    SetParent(SubjectSetParentArgs),
    ClearParent(SubjectArgs),
    ShowParent(SubjectArgs),
}

#[derive(Debug, Args)]
struct SubjectSetParentArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    parent: String,
}

#[derive(Debug, Args)]
struct SubjectArgs {
    #[arg(long)]
    subject: String,
}

#[derive(Debug, Subcommand)]
enum PackageCommand {
    Create(PackageCreateArgs),
    Attach(PackageAttachArgs),
    List(SubjectArgs),
}

#[derive(Debug, Args)]
struct PackageCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
struct PackageAttachArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    package: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    approver: Option<String>,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Value(QueryArgs),
    Exists(QueryArgs),
    Count(QueryArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    subject: String,
    #[arg(long, default_value = "text")]
    strand: String,
    #[arg(long)]
    key: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ViewCommand {
    Show(ViewShowArgs),
    Metadatum(ViewKeyArgs),
    ImageOrText(ViewKeyArgs),
}

#[derive(Debug, Args)]
struct ViewShowArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct ViewKeyArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    key: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ValueKindArg {
    Text,
    Image,
}

impl From<ValueKindArg> for ValueKind {
    fn from(value: ValueKindArg) -> Self {
        match value {
            ValueKindArg::Text => ValueKind::Text,
            ValueKindArg::Image => ValueKind::Image,
        }
    }
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
        other => serde_json::json!({
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
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(path: Option<&Path>) -> Result<ResolverConfig> {
    let Some(path) = path else {
        return Ok(ResolverConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read resolver config {}", path.display()))?;
    let config: ResolverConfig = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse resolver config {}", path.display()))?;
    config.validate()?;
    tracing::debug!("Loaded resolver config from {}", path.display());
    Ok(config)
}

fn parse_subject(raw: &str) -> Result<SubjectRef> {
    SubjectRef::parse(raw).ok_or_else(|| anyhow!("subject must look like kind:id, got {raw:?}"))
}

fn parse_optional_date(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(parse_rfc3339).transpose()
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Key { command } => {
            store.migrate()?;
            run_key(*command, &store)
        }
        Command::Strand { command } => {
            store.migrate()?;
            run_strand(*command, &store)
        }
        Command::Entry { command } => {
            store.migrate()?;
            run_entry(*command, &store)
        }
        Command::Subject { command } => {
            store.migrate()?;
            run_subject(*command, &store)
        }
        Command::Package { command } => {
            store.migrate()?;
            run_package(*command, &mut store)
        }
        Command::Query { command } => {
            store.migrate()?;
            let config = load_config(cli.config.as_deref())?;
            run_query(*command, &store, config)
        }
        Command::View { command } => {
            store.migrate()?;
            let config = load_config(cli.config.as_deref())?;
            run_view(*command, &store, config)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::PurgeCache(args) => {
            store.migrate()?;
            let removed =
                if args.all { store.clear_query_cache()? } else { store.purge_query_cache()? };
            emit_json(serde_json::json!({ "all": args.all, "removed": removed }))
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    let after = store.migrate()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_key(command: KeyCommand, store: &SqliteStore) -> Result<()> {
    match command {
        KeyCommand::Add(args) => {
            let key = store.add_key(
                &args.name,
                &args.description,
                args.allow_multiple,
                args.cache_seconds,
            )?;
            emit_json(serde_json::json!({ "key": key }))
        }
        KeyCommand::List => emit_json(serde_json::json!({ "keys": store.list_keys()? })),
    }
}

fn run_strand(command: StrandCommand, store: &SqliteStore) -> Result<()> {
    match command {
        StrandCommand::Declare(args) => {
            let declared = store.declare_strand(&args.kind, &args.strand, args.value_kind.into())?;
            emit_json(serde_json::json!({ "strand": declared }))
        }
        StrandCommand::List(args) => {
            emit_json(serde_json::json!({ "strands": store.list_strands(&args.kind)? }))
        }
    }
}

fn run_entry(command: EntryCommand, store: &SqliteStore) -> Result<()> {
    match command {
        EntryCommand::Add(args) => {
            let entry = build_entry(args, store)?;
            store.write_entry(&entry)?;
            emit_json(serde_json::json!({ "entry": entry }))
        }
        EntryCommand::Approve(args) => {
            let entry_id = parse_entry_id(&args.entry_id)?;
            store.approve_entry(entry_id, &args.approver)?;
            emit_json(serde_json::json!({
                "entry_id": entry_id,
                "approver": args.approver,
                "status": "approved"
            }))
        }
        EntryCommand::List(args) => {
            let entries = match (args.subject.as_deref(), args.default_kind.as_deref()) {
                (Some(raw), _) => {
                    let subject = parse_subject(raw)?;
                    store.list_entries(EntryScope::Subject(&subject))?
                }
                (None, Some(kind)) => store.list_entries(EntryScope::Defaults { kind })?,
                (None, None) => return Err(anyhow!("one of --subject or --default-kind is required")),
            };
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn build_entry(args: EntryAddArgs, store: &SqliteStore) -> Result<MetadataEntry> {
    let (element, subject_kind) = match (args.scope.subject, args.scope.default_kind) {
        (Some(raw), _) => {
            let subject = parse_subject(&raw)?;
            let kind = subject.kind.clone();
            (Some(subject), kind)
        }
        (None, Some(kind)) => (None, kind),
        (None, None) => return Err(anyhow!("one of --subject or --default-kind is required")),
    };

    let key = store
        .find_key(&KeyRef::from(args.key.as_str()))?
        .ok_or_else(|| anyhow!("metadata key {} is not registered", args.key))?;
    let declared = store
        .list_strands(&subject_kind)?
        .into_iter()
        .find(|declared| declared.strand == args.strand)
        .ok_or_else(|| {
            anyhow!("strand {} is not declared for subject kind {subject_kind}", args.strand)
        })?;

    Ok(MetadataEntry {
        entry_id: EntryId::new(),
        element,
        subject_kind,
        strand: args.strand,
        key_id: key.id,
        value: MetadataValue::from_parts(declared.value_kind, args.value),
        effective_from: parse_rfc3339(&args.from)?,
        effective_to: parse_optional_date(args.to.as_deref())?,
        creator: args.creator,
        approver: args.approver,
    })
}

fn run_subject(command: SubjectCommand, store: &SqliteStore) -> Result<()> {
    match command {
        SubjectCommand::SetParent(args) => {
            let subject = parse_subject(&args.subject)?;
            let parent = parse_subject(&args.parent)?;
            store.set_parent(&subject, &parent)?;
            emit_json(serde_json::json!({ "subject": subject, "parent": parent }))
        }
        SubjectCommand::ClearParent(args) => {
            let subject = parse_subject(&args.subject)?;
            let cleared = store.clear_parent(&subject)?;
            emit_json(serde_json::json!({ "subject": subject, "cleared": cleared }))
        }
        SubjectCommand::ShowParent(args) => {
            let subject = parse_subject(&args.subject)?;
            let parent = store.get_parent(&subject)?;
            emit_json(serde_json::json!({ "subject": subject, "parent": parent }))
        }
    }
}

fn run_package(command: PackageCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        PackageCommand::Create(args) => {
            let package = store.create_package(&args.name, &args.description)?;
            emit_json(serde_json::json!({ "package": package }))
        }
        PackageCommand::Attach(args) => {
            let subject = parse_subject(&args.subject)?;
            let attachment = PackageAttachment {
                package: SubjectRef::package(args.package),
                effective_from: parse_rfc3339(&args.from)?,
                effective_to: parse_optional_date(args.to.as_deref())?,
                approver: args.approver,
            };
            let position = store.attach_package(&subject, &attachment)?;
            emit_json(serde_json::json!({
                "subject": subject,
                "attachment": attachment,
                "position": position
            }))
        }
        PackageCommand::List(args) => {
            let subject = parse_subject(&args.subject)?;
            let attachments = store.list_attachments(&subject)?;
            emit_json(serde_json::json!({ "subject": subject, "attachments": attachments }))
        }
    }
}

fn run_query(command: QueryCommand, store: &SqliteStore, config: ResolverConfig) -> Result<()> {
    let (query_type, args) = match command {
        QueryCommand::Value(args) => (QueryType::Value, args),
        QueryCommand::Exists(args) => (QueryType::Exists, args),
        QueryCommand::Count(args) => (QueryType::Count, args),
    };
    let resolver = Resolver::new(store, store, store).with_config(config);
    let query = resolver.build_query(
        parse_subject(&args.subject)?,
        &args.strand,
        args.key.as_str(),
        query_type,
        parse_optional_date(args.as_of.as_deref())?,
    )?;
    let result = resolver.run_query(&query)?;
    emit_json(serde_json::json!({
        "query": query.to_string(),
        "cache_key": query.cache_key(),
        "result": result
    }))
}

fn run_view(command: ViewCommand, store: &SqliteStore, config: ResolverConfig) -> Result<()> {
    let resolver = Resolver::new(store, store, store).with_config(config);
    match command {
        ViewCommand::Show(args) => {
            let subject = parse_subject(&args.subject)?;
            let view = match parse_optional_date(args.as_of.as_deref())? {
                Some(date) => resolver.metadata_at(subject, date),
                None => resolver.metadata(subject),
            };
            emit_json(serde_json::json!({
                "subject": view.subject(),
                "strands": view.strands()?,
                "title": view.title()?,
                "description": view.description()?,
                "title_image": view.title_image()?
            }))
        }
        ViewCommand::Metadatum(args) => {
            let subject = parse_subject(&args.subject)?;
            let view = match parse_optional_date(args.as_of.as_deref())? {
                Some(date) => resolver.metadata_at(subject, date),
                None => resolver.metadata(subject),
            };
            emit_json(serde_json::json!({
                "subject": view.subject(),
                "key": args.key,
                "metadatum": view.metadatum(args.key.as_str())?
            }))
        }
        ViewCommand::ImageOrText(args) => {
            let subject = parse_subject(&args.subject)?;
            let view = match parse_optional_date(args.as_of.as_deref())? {
                Some(date) => resolver.metadata_at(subject, date),
                None => resolver.metadata(subject),
            };
            let found = view.image_or_text(args.key.as_str())?;
            emit_json(serde_json::json!({
                "subject": view.subject(),
                "key": args.key,
                "preferred": found.preferred(),
                "image": found.image,
                "text": found.text
            }))
        }
    }
}
