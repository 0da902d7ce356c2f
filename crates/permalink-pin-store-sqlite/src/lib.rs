use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use permalink_pin_core::{
    slugify, validate_slug, Category, PinError, Post, PostId, PreferenceSource, TermId,
    PREFERENCE_META_KEY,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS terms (
  term_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  slug TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS posts (
  post_id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  slug TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS post_terms (
  post_id INTEGER NOT NULL,
  term_id INTEGER NOT NULL,
  PRIMARY KEY (post_id, term_id),
  FOREIGN KEY (post_id) REFERENCES posts(post_id),
  FOREIGN KEY (term_id) REFERENCES terms(term_id)
);

CREATE TABLE IF NOT EXISTS post_meta (
  post_id INTEGER NOT NULL,
  meta_key TEXT NOT NULL,
  meta_value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (post_id, meta_key),
  FOREIGN KEY (post_id) REFERENCES posts(post_id)
);

CREATE INDEX IF NOT EXISTS idx_post_terms_term ON post_terms(term_id);
CREATE INDEX IF NOT EXISTS idx_post_meta_key ON post_meta(meta_key);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_terms: usize,
    pub skipped_existing_terms: usize,
    pub imported_posts: usize,
    pub skipped_existing_posts: usize,
    pub imported_assignments: usize,
    pub skipped_existing_assignments: usize,
    pub imported_meta: usize,
    pub skipped_existing_meta: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TermRow {
    term_id: i64,
    name: String,
    slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PostRow {
    post_id: i64,
    title: String,
    slug: String,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct AssignmentRow {
    post_id: i64,
    term_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct MetaRow {
    post_id: i64,
    meta_key: String,
    meta_value: String,
    updated_at: String,
}

const TERMS_FILE: &str = "terms.ndjson";
const POSTS_FILE: &str = "posts.ndjson";
const ASSIGNMENTS_FILE: &str = "post_terms.ndjson";
const META_FILE: &str = "post_meta.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

impl SqliteStore {
    /// Open a SQLite-backed content store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut current_version = current_schema_version(&self.conn)?;
        let mut inferred_from_legacy = false;
        if current_version == 0 && table_exists(&self.conn, "posts")? {
            // Database created before the migration ledger existed.
            current_version = 1;
            inferred_from_legacy = true;
        }

        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            if table_exists(&self.conn, "posts")? {
                // Tables pre-date the ledger; record version 1 without re-applying.
                record_schema_version(&self.conn, 1)?;
            } else {
                self.conn
                    .execute_batch(MIGRATION_001_SQL)
                    .context("failed to apply migration v1")?;
                record_schema_version(&self.conn, 1)?;
            }
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create one taxonomy term. The slug defaults to a slugified name.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails (duplicate slug).
    pub fn create_term(&mut self, name: &str, slug: Option<&str>) -> Result<Category> {
        if name.trim().is_empty() {
            return Err(validation(PinError::Validation(
                "category name MUST be non-empty".to_string(),
            )));
        }

        let slug = match slug {
            Some(value) => value.to_string(),
            None => slugify(name),
        };
        validate_slug(&slug).map_err(validation)?;

        self.conn
            .execute("INSERT INTO terms(name, slug) VALUES (?1, ?2)", params![name, slug])
            .context("failed to insert term")?;

        Ok(Category {
            id: TermId(self.conn.last_insert_rowid()),
            name: name.to_string(),
            slug,
        })
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn term(&self, term_id: TermId) -> Result<Option<Category>> {
        let mut stmt = self
            .conn
            .prepare("SELECT term_id, name, slug FROM terms WHERE term_id = ?1")?;
        let category = stmt
            .query_row(params![term_id.0], |row| {
                Ok(Category { id: TermId(row.get(0)?), name: row.get(1)?, slug: row.get(2)? })
            })
            .optional()
            .context("failed to load term")?;
        Ok(category)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_terms(&self) -> Result<Vec<Category>> {
        let mut stmt = self
            .conn
            .prepare("SELECT term_id, name, slug FROM terms ORDER BY term_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Category { id: TermId(row.get(0)?), name: row.get(1)?, slug: row.get(2)? })
        })?;

        let mut terms = Vec::new();
        for row in rows {
            terms.push(row.context("failed to decode term row")?);
        }
        Ok(terms)
    }

    /// Create one post. The slug defaults to a slugified title.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails (duplicate slug).
    pub fn create_post(&mut self, title: &str, slug: Option<&str>) -> Result<Post> {
        if title.trim().is_empty() {
            return Err(validation(PinError::Validation(
                "post title MUST be non-empty".to_string(),
            )));
        }

        let slug = match slug {
            Some(value) => value.to_string(),
            None => slugify(title),
        };
        validate_slug(&slug).map_err(validation)?;

        self.conn
            .execute(
                "INSERT INTO posts(title, slug, created_at) VALUES (?1, ?2, ?3)",
                params![title, slug, now_rfc3339()?],
            )
            .context("failed to insert post")?;

        Ok(Post { id: PostId(self.conn.last_insert_rowid()), title: title.to_string(), slug })
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn post(&self, post_id: PostId) -> Result<Option<Post>> {
        let mut stmt = self
            .conn
            .prepare("SELECT post_id, title, slug FROM posts WHERE post_id = ?1")?;
        let post = stmt
            .query_row(params![post_id.0], |row| {
                Ok(Post { id: PostId(row.get(0)?), title: row.get(1)?, slug: row.get(2)? })
            })
            .optional()
            .context("failed to load post")?;
        Ok(post)
    }

    /// Replace the full set of category assignments for one post.
    ///
    /// # Errors
    /// Returns an error when the post or any term does not exist, or writes fail.
    pub fn set_post_terms(&mut self, post_id: PostId, term_ids: &[TermId]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start assignment transaction")?;

        tx.execute("DELETE FROM post_terms WHERE post_id = ?1", params![post_id.0])
            .context("failed to clear existing assignments")?;
        for term_id in term_ids {
            tx.execute(
                "INSERT INTO post_terms(post_id, term_id) VALUES (?1, ?2)",
                params![post_id.0, term_id.0],
            )
            .with_context(|| format!("failed to assign term {term_id} to post {post_id}"))?;
        }

        tx.commit().context("failed to commit assignment transaction")?;
        Ok(())
    }

    /// Load the categories assigned to a post, lowest term id first. The
    /// leading entry doubles as the host's own default pick.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn assigned_categories(&self, post_id: PostId) -> Result<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.term_id, t.name, t.slug
             FROM post_terms pt
             JOIN terms t ON t.term_id = pt.term_id
             WHERE pt.post_id = ?1
             ORDER BY t.term_id ASC",
        )?;
        let rows = stmt.query_map(params![post_id.0], |row| {
            Ok(Category { id: TermId(row.get(0)?), name: row.get(1)?, slug: row.get(2)? })
        })?;

        let mut categories = Vec::new();
        for row in rows {
            categories.push(row.context("failed to decode assigned category")?);
        }
        Ok(categories)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn host_default_category(&self, post_id: PostId) -> Result<Option<Category>> {
        Ok(self.assigned_categories(post_id)?.into_iter().next())
    }

    /// Upsert one generic per-post metadata value. Last writer wins.
    ///
    /// # Errors
    /// Returns an error when the post does not exist or the write fails.
    pub fn set_meta(&mut self, post_id: PostId, meta_key: &str, meta_value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO post_meta(post_id, meta_key, meta_value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(post_id, meta_key)
                 DO UPDATE SET meta_value = excluded.meta_value, updated_at = excluded.updated_at",
                params![post_id.0, meta_key, meta_value, now_rfc3339()?],
            )
            .context("failed to upsert post metadata")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_meta(&self, post_id: PostId, meta_key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT meta_value FROM post_meta WHERE post_id = ?1 AND meta_key = ?2",
        )?;
        let value = stmt
            .query_row(params![post_id.0, meta_key], |row| row.get::<_, String>(0))
            .optional()
            .context("failed to load post metadata")?;
        Ok(value)
    }

    /// Persist a category preference for one post under the fixed metadata
    /// key, serialized as integer-as-string. A non-positive id is a silent
    /// no-op; no validation against current assignments happens at write time.
    ///
    /// # Errors
    /// Returns an error only when the underlying metadata write fails.
    pub fn set_preference(&mut self, post_id: PostId, term_id: TermId) -> Result<()> {
        if !term_id.is_valid() {
            return Ok(());
        }
        self.set_meta(post_id, PREFERENCE_META_KEY, &term_id.to_string())
    }

    /// Read the stored preference. Malformed stored values read as none.
    ///
    /// # Errors
    /// Returns an error when the metadata lookup fails.
    pub fn get_preference(&self, post_id: PostId) -> Result<Option<TermId>> {
        Ok(self
            .get_meta(post_id, PREFERENCE_META_KEY)?
            .as_deref()
            .and_then(TermId::parse))
    }

    /// Export terms, posts, assignments, and metadata as deterministic NDJSON
    /// plus a manifest of per-file digests.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let terms = self.term_rows()?;
        let posts = self.post_rows()?;
        let assignments = self.assignment_rows()?;
        let meta = self.meta_rows()?;

        let files = vec![
            digest_entry(TERMS_FILE, write_ndjson_file(&out_dir.join(TERMS_FILE), &terms)?),
            digest_entry(POSTS_FILE, write_ndjson_file(&out_dir.join(POSTS_FILE), &posts)?),
            digest_entry(
                ASSIGNMENTS_FILE,
                write_ndjson_file(&out_dir.join(ASSIGNMENTS_FILE), &assignments)?,
            ),
            digest_entry(META_FILE, write_ndjson_file(&out_dir.join(META_FILE), &meta)?),
        ];

        let manifest =
            ExportManifest { schema_version: LATEST_SCHEMA_VERSION, exported_at: now_rfc3339()?, files };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest verification, parsing, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;

        let manifest_path = in_dir.join(MANIFEST_FILE);
        let manifest_json = fs::read_to_string(&manifest_path).with_context(|| {
            format!("failed to read import manifest {}", manifest_path.display())
        })?;
        let manifest: ExportManifest =
            serde_json::from_str(&manifest_json).context("failed to parse import manifest")?;

        for file in &manifest.files {
            let path = in_dir.join(&file.path);
            let digest = file_sha256(&path)?;
            if digest != file.sha256 {
                return Err(anyhow!(
                    "digest mismatch for {}: manifest {} actual {digest}",
                    file.path,
                    file.sha256
                ));
            }
        }

        let terms: Vec<TermRow> = read_ndjson_file(&in_dir.join(TERMS_FILE))?;
        let posts: Vec<PostRow> = read_ndjson_file(&in_dir.join(POSTS_FILE))?;
        let assignments: Vec<AssignmentRow> = read_ndjson_file(&in_dir.join(ASSIGNMENTS_FILE))?;
        let meta: Vec<MetaRow> = read_ndjson_file(&in_dir.join(META_FILE))?;

        let mut summary = ImportSummary::default();
        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for row in terms {
            let exists = row_exists(&tx, "SELECT 1 FROM terms WHERE term_id = ?1", row.term_id)?;
            if exists && skip_existing {
                summary.skipped_existing_terms += 1;
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO terms(term_id, name, slug) VALUES (?1, ?2, ?3)",
                params![row.term_id, row.name, row.slug],
            )
            .context("failed to import term")?;
            summary.imported_terms += 1;
        }

        for row in posts {
            let exists = row_exists(&tx, "SELECT 1 FROM posts WHERE post_id = ?1", row.post_id)?;
            if exists && skip_existing {
                summary.skipped_existing_posts += 1;
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO posts(post_id, title, slug, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.post_id, row.title, row.slug, row.created_at],
            )
            .context("failed to import post")?;
            summary.imported_posts += 1;
        }

        for row in assignments {
            let exists = tx
                .prepare("SELECT 1 FROM post_terms WHERE post_id = ?1 AND term_id = ?2")?
                .query_row(params![row.post_id, row.term_id], |_| Ok(()))
                .optional()
                .context("failed to check existing assignment")?
                .is_some();
            if exists && skip_existing {
                summary.skipped_existing_assignments += 1;
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO post_terms(post_id, term_id) VALUES (?1, ?2)",
                params![row.post_id, row.term_id],
            )
            .context("failed to import assignment")?;
            summary.imported_assignments += 1;
        }

        for row in meta {
            let exists = tx
                .prepare("SELECT 1 FROM post_meta WHERE post_id = ?1 AND meta_key = ?2")?
                .query_row(params![row.post_id, row.meta_key], |_| Ok(()))
                .optional()
                .context("failed to check existing metadata")?
                .is_some();
            if exists && skip_existing {
                summary.skipped_existing_meta += 1;
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO post_meta(post_id, meta_key, meta_value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.post_id, row.meta_key, row.meta_value, row.updated_at],
            )
            .context("failed to import metadata")?;
            summary.imported_meta += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Run `quick_check` and `foreign_key_check` and report schema status.
    ///
    /// # Errors
    /// Returns an error when the pragmas cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run quick_check")?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get::<_, Option<i64>>(1)?.unwrap_or(-1),
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.context("failed to decode foreign key violation")?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    /// Write an online backup of the main database to `out`.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out: &Path) -> Result<()> {
        self.conn
            .backup(DatabaseName::Main, out, None)
            .with_context(|| format!("failed to back up database to {}", out.display()))
    }

    /// Replace the main database with the backup at `input`.
    ///
    /// # Errors
    /// Returns an error when the restore fails.
    pub fn restore_database(&mut self, input: &Path) -> Result<()> {
        self.conn
            .restore(DatabaseName::Main, input, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore database from {}", input.display()))
    }

    fn term_rows(&self) -> Result<Vec<TermRow>> {
        let mut stmt =
            self.conn.prepare("SELECT term_id, name, slug FROM terms ORDER BY term_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(TermRow { term_id: row.get(0)?, name: row.get(1)?, slug: row.get(2)? })
        })?;
        collect_rows(rows, "term")
    }

    fn post_rows(&self) -> Result<Vec<PostRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT post_id, title, slug, created_at FROM posts ORDER BY post_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PostRow {
                post_id: row.get(0)?,
                title: row.get(1)?,
                slug: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        collect_rows(rows, "post")
    }

    fn assignment_rows(&self) -> Result<Vec<AssignmentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT post_id, term_id FROM post_terms ORDER BY post_id ASC, term_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok(AssignmentRow { post_id: row.get(0)?, term_id: row.get(1)? }))?;
        collect_rows(rows, "assignment")
    }

    fn meta_rows(&self) -> Result<Vec<MetaRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT post_id, meta_key, meta_value, updated_at
             FROM post_meta ORDER BY post_id ASC, meta_key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MetaRow {
                post_id: row.get(0)?,
                meta_key: row.get(1)?,
                meta_value: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        collect_rows(rows, "metadata")
    }
}

impl PreferenceSource for SqliteStore {
    // Read failures degrade to "no preference"; the selector then falls back
    // to the host default.
    fn preference(&self, post_id: PostId) -> Option<TermId> {
        self.get_preference(post_id).ok().flatten()
    }
}

fn validation(err: PinError) -> anyhow::Error {
    anyhow!("{err}")
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    label: &str,
) -> Result<Vec<T>> {
    let mut collected = Vec::new();
    for row in rows {
        collected.push(row.with_context(|| format!("failed to decode {label} row"))?);
    }
    Ok(collected)
}

fn row_exists(conn: &Connection, sql: &str, id: i64) -> Result<bool> {
    let exists = conn
        .prepare(sql)?
        .query_row(params![id], |_| Ok(()))
        .optional()
        .context("failed to check existing row")?
        .is_some();
    Ok(exists)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .query_row(params![name], |_| Ok(()))
        .optional()
        .context("failed to inspect sqlite_master")?
        .is_some();
    Ok(exists)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format current timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, rows: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for row in rows {
        let line = serde_json::to_string(row).context("failed to serialize export row")?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    let digest = hasher.finalize();
    Ok((format!("{digest:x}"), rows.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open import file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(
            serde_json::from_str(&line)
                .with_context(|| format!("failed to parse NDJSON row in {}", path.display()))?,
        );
    }
    Ok(rows)
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for digest {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read file for digest {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}

fn digest_entry(path: &str, digest: (String, usize)) -> ExportFileDigest {
    ExportFileDigest { path: path.to_string(), sha256: digest.0, records: digest.1 }
}
