use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use permalink_pin_api::{
    AssignRequest, PermalinkPinApi, PostAddRequest, SavePreferenceRequest, TermAddRequest,
};
use permalink_pin_core::{PermalinkStructure, PostId, TermId};
use permalink_pin_store_sqlite::SqliteStore;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ppin")]
#[command(about = "Permalink category pinning CLI")]
struct Cli {
    #[arg(long, default_value = "./permalink_pin.sqlite3")]
    db: PathBuf,

    /// Configured permalink pattern; the category override only activates
    /// when it carries the %category% placeholder.
    #[arg(long, default_value = "/%category%/%postname%/")]
    structure: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Term {
        #[command(subcommand)]
        command: Box<TermCommand>,
    },
    Post {
        #[command(subcommand)]
        command: Box<PostCommand>,
    },
    Prefer {
        #[command(subcommand)]
        command: Box<PreferCommand>,
    },
    Resolve(ResolveArgs),
    Permalink(PermalinkArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TermCommand {
    Add(TermAddArgs),
    List,
}

#[derive(Debug, Args)]
struct TermAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    slug: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PostCommand {
    Add(PostAddArgs),
    Assign(PostAssignArgs),
    Show(PostShowArgs),
}

#[derive(Debug, Args)]
struct PostAddArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    slug: Option<String>,
    #[arg(long = "term")]
    terms: Vec<i64>,
}

#[derive(Debug, Args)]
struct PostAssignArgs {
    #[arg(long)]
    post: i64,
    #[arg(long = "term")]
    terms: Vec<i64>,
}

#[derive(Debug, Args)]
struct PostShowArgs {
    #[arg(long)]
    post: i64,
}

#[derive(Debug, Subcommand)]
enum PreferCommand {
    Set(PreferSetArgs),
    Show(PreferShowArgs),
    Options(PreferShowArgs),
}

#[derive(Debug, Args)]
struct PreferSetArgs {
    #[arg(long)]
    post: i64,
    /// Raw form value for the category_in_permalink field; omit to emulate a
    /// submission that never carried the field.
    #[arg(long)]
    value: Option<String>,
    #[arg(long, default_value_t = false)]
    autosave: bool,
    #[arg(long, default_value_t = false)]
    no_edit_permission: bool,
}

#[derive(Debug, Args)]
struct PreferShowArgs {
    #[arg(long)]
    post: i64,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    post: i64,
}

#[derive(Debug, Args)]
struct PermalinkArgs {
    /// One or more post ids; the whole invocation shares one request scope.
    #[arg(long = "post", required = true)]
    posts: Vec<i64>,
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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let api = PermalinkPinApi::new(cli.db.clone(), PermalinkStructure::new(cli.structure.as_str()));

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Term { command } => run_term(*command, &api),
        Command::Post { command } => run_post(*command, &api),
        Command::Prefer { command } => run_prefer(*command, &api),
        Command::Resolve(args) => run_resolve(&args, &api),
        Command::Permalink(args) => run_permalink(&args, &api),
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
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions,
                    "inferred_from_legacy": before.inferred_from_legacy
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = store.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_term(command: TermCommand, api: &PermalinkPinApi) -> Result<()> {
    match command {
        TermCommand::Add(args) => {
            let category = api.term_add(TermAddRequest { name: args.name, slug: args.slug })?;
            emit_json(serde_json::json!({
                "term_id": category.id,
                "name": category.name,
                "slug": category.slug
            }))
        }
        TermCommand::List => {
            let terms = api.term_list()?;
            emit_json(serde_json::json!({ "terms": terms }))
        }
    }
}

fn run_post(command: PostCommand, api: &PermalinkPinApi) -> Result<()> {
    match command {
        PostCommand::Add(args) => {
            let post = api.post_add(PostAddRequest {
                title: args.title,
                slug: args.slug,
                term_ids: args.terms.into_iter().map(TermId).collect(),
            })?;
            emit_json(serde_json::json!({
                "post_id": post.id,
                "title": post.title,
                "slug": post.slug
            }))
        }
        PostCommand::Assign(args) => {
            let details = api.post_assign(AssignRequest {
                post_id: PostId(args.post),
                term_ids: args.terms.into_iter().map(TermId).collect(),
            })?;
            emit_json(serde_json::to_value(&details).context("failed to serialize post details")?)
        }
        PostCommand::Show(args) => {
            let details = api.post_show(PostId(args.post))?;
            emit_json(serde_json::to_value(&details).context("failed to serialize post details")?)
        }
    }
}

fn run_prefer(command: PreferCommand, api: &PermalinkPinApi) -> Result<()> {
    match command {
        PreferCommand::Set(args) => {
            let result = api.save_preference(SavePreferenceRequest {
                post_id: PostId(args.post),
                submitted: args.value,
                autosave: args.autosave,
                can_edit: !args.no_edit_permission,
            })?;
            emit_json(serde_json::json!({
                "post_id": result.post_id,
                "stored": result.stored,
                "outcome": result.outcome.as_str()
            }))
        }
        PreferCommand::Show(args) => {
            let status = api.preference_show(PostId(args.post))?;
            emit_json(
                serde_json::to_value(&status).context("failed to serialize preference status")?,
            )
        }
        PreferCommand::Options(args) => {
            let options = api.preference_options(PostId(args.post))?;
            emit_json(
                serde_json::to_value(&options).context("failed to serialize preference options")?,
            )
        }
    }
}

fn run_resolve(args: &ResolveArgs, api: &PermalinkPinApi) -> Result<()> {
    let selection = api.resolve_category(PostId(args.post))?;
    emit_json(serde_json::json!({
        "post_id": args.post,
        "category": selection.category,
        "source": selection.source.as_str(),
        "memoized": selection.memoized,
        "reasons": selection.reasons
    }))
}

fn run_permalink(args: &PermalinkArgs, api: &PermalinkPinApi) -> Result<()> {
    let post_ids = args.posts.iter().copied().map(PostId).collect::<Vec<_>>();
    let results = api.permalinks(&post_ids)?;
    let permalinks = results
        .iter()
        .map(|result| {
            serde_json::json!({
                "post_id": result.post.id,
                "permalink": result.permalink,
                "source": result.selection.source.as_str(),
                "memoized": result.selection.memoized
            })
        })
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({ "permalinks": permalinks }))
}
