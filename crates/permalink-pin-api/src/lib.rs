use std::path::PathBuf;

use anyhow::{anyhow, Result};
use permalink_pin_core::{
    Category, CategorySelector, PermalinkStructure, Post, PostId, Selection, SelectionSource,
    TermId,
};
use permalink_pin_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermAddRequest {
    pub name: String,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostAddRequest {
    pub title: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub term_ids: Vec<TermId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignRequest {
    pub post_id: PostId,
    pub term_ids: Vec<TermId>,
}

/// One admin save action, carried exactly as the host hands it over: the raw
/// `category_in_permalink` form field (if it was present at all) plus the
/// autosave and permission state the host has already determined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavePreferenceRequest {
    pub post_id: PostId,
    pub submitted: Option<String>,
    #[serde(default)]
    pub autosave: bool,
    #[serde(default = "default_can_edit")]
    pub can_edit: bool,
}

fn default_can_edit() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Stored,
    SkippedAutosave,
    SkippedPermission,
    SkippedMissingField,
    SkippedInvalidValue,
}

impl SaveOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::SkippedAutosave => "skipped_autosave",
            Self::SkippedPermission => "skipped_permission",
            Self::SkippedMissingField => "skipped_missing_field",
            Self::SkippedInvalidValue => "skipped_invalid_value",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavePreferenceResult {
    pub post_id: PostId,
    pub stored: Option<TermId>,
    pub outcome: SaveOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreferenceStatus {
    pub post_id: PostId,
    pub stored: Option<TermId>,
    /// Whether the stored value still names an assigned category. Absent when
    /// nothing is stored.
    pub valid: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreferenceOption {
    pub term_id: Option<TermId>,
    pub label: String,
    pub selected: bool,
}

/// Data behind the admin side-panel control: either an informational message
/// (zero or one assigned categories) or the single-choice option list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreferenceOptions {
    pub post_id: PostId,
    pub control: bool,
    pub message: Option<String>,
    pub options: Vec<PreferenceOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostDetails {
    pub post: Post,
    pub categories: Vec<Category>,
    pub preference: Option<TermId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermalinkResult {
    pub post: Post,
    pub permalink: String,
    pub selection: Selection,
}

#[derive(Debug, Clone)]
pub struct PermalinkPinApi {
    db_path: PathBuf,
    structure: PermalinkStructure,
    active: bool,
}

impl PermalinkPinApi {
    /// Build the api over a database path and the configured permalink
    /// pattern. The pattern is inspected exactly once, here: without a
    /// `%category%` placeholder the override stays inactive for the lifetime
    /// of this value and resolution never consults the preference store.
    #[must_use]
    pub fn new(db_path: PathBuf, structure: PermalinkStructure) -> Self {
        let active = structure.has_category_placeholder();
        Self { db_path, structure, active }
    }

    #[must_use]
    pub fn structure(&self) -> &PermalinkStructure {
        &self.structure
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create one taxonomy term.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn term_add(&self, input: TermAddRequest) -> Result<Category> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.create_term(&input.name, input.slug.as_deref())
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn term_list(&self) -> Result<Vec<Category>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_terms()
    }

    /// Create one post, optionally assigning categories in the same call.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn post_add(&self, input: PostAddRequest) -> Result<Post> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let post = store.create_post(&input.title, input.slug.as_deref())?;
        if !input.term_ids.is_empty() {
            store.set_post_terms(post.id, &input.term_ids)?;
        }
        Ok(post)
    }

    /// Replace a post's category assignments.
    ///
    /// # Errors
    /// Returns an error when the post or any term does not exist.
    pub fn post_assign(&self, input: AssignRequest) -> Result<PostDetails> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.set_post_terms(input.post_id, &input.term_ids)?;
        self.post_details(&store, input.post_id)
    }

    /// # Errors
    /// Returns an error when the post does not exist or lookups fail.
    pub fn post_show(&self, post_id: PostId) -> Result<PostDetails> {
        let mut store = self.open_store()?;
        store.migrate()?;
        self.post_details(&store, post_id)
    }

    fn post_details(&self, store: &SqliteStore, post_id: PostId) -> Result<PostDetails> {
        let post = store
            .post(post_id)?
            .ok_or_else(|| anyhow!("post not found: {post_id}"))?;
        Ok(PostDetails {
            post,
            categories: store.assigned_categories(post_id)?,
            preference: store.get_preference(post_id)?,
        })
    }

    /// Run the admin save flow. Every skip condition the host enforces
    /// degrades to a reported no-op, never an error: autosave in
    /// progress, missing edit permission, an absent or empty form field, and
    /// a value that does not parse as a positive integer.
    ///
    /// # Errors
    /// Returns an error only when the underlying store write fails.
    pub fn save_preference(&self, input: SavePreferenceRequest) -> Result<SavePreferenceResult> {
        let skip = |outcome: SaveOutcome| {
            debug!(post = %input.post_id, outcome = outcome.as_str(), "preference save skipped");
            SavePreferenceResult { post_id: input.post_id, stored: None, outcome }
        };

        if input.autosave {
            return Ok(skip(SaveOutcome::SkippedAutosave));
        }
        if !input.can_edit {
            return Ok(skip(SaveOutcome::SkippedPermission));
        }
        let Some(raw) = input.submitted.as_deref() else {
            return Ok(skip(SaveOutcome::SkippedMissingField));
        };
        if raw.trim().is_empty() {
            return Ok(skip(SaveOutcome::SkippedMissingField));
        }
        let Some(term_id) = TermId::parse(raw) else {
            return Ok(skip(SaveOutcome::SkippedInvalidValue));
        };

        let mut store = self.open_store()?;
        store.migrate()?;
        store.set_preference(input.post_id, term_id)?;
        debug!(post = %input.post_id, term = %term_id, "preference stored");

        Ok(SavePreferenceResult {
            post_id: input.post_id,
            stored: Some(term_id),
            outcome: SaveOutcome::Stored,
        })
    }

    /// # Errors
    /// Returns an error when lookups fail.
    pub fn preference_show(&self, post_id: PostId) -> Result<PreferenceStatus> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let stored = store.get_preference(post_id)?;
        let valid = match stored {
            Some(term_id) => {
                let assigned = store.assigned_categories(post_id)?;
                Some(assigned.iter().any(|category| category.id == term_id))
            }
            None => None,
        };
        Ok(PreferenceStatus { post_id, stored, valid })
    }

    /// Build the option list for the admin side panel. With fewer than two
    /// assigned categories there is no control, only a message.
    ///
    /// # Errors
    /// Returns an error when lookups fail.
    pub fn preference_options(&self, post_id: PostId) -> Result<PreferenceOptions> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let assigned = store.assigned_categories(post_id)?;

        if assigned.is_empty() {
            return Ok(PreferenceOptions {
                post_id,
                control: false,
                message: Some("No categories selected.".to_string()),
                options: Vec::new(),
            });
        }
        if assigned.len() == 1 {
            return Ok(PreferenceOptions {
                post_id,
                control: false,
                message: Some(
                    "Only one category is currently selected which will be used in the permalink."
                        .to_string(),
                ),
                options: Vec::new(),
            });
        }

        let stored = store.get_preference(post_id)?;
        let mut options = vec![PreferenceOption {
            term_id: None,
            label: "Default Category".to_string(),
            selected: stored.is_none(),
        }];
        for category in &assigned {
            options.push(PreferenceOption {
                term_id: Some(category.id),
                label: category.name.clone(),
                selected: stored == Some(category.id),
            });
        }

        Ok(PreferenceOptions { post_id, control: true, message: None, options })
    }

    /// Resolve the category that belongs in one post's permalink.
    ///
    /// # Errors
    /// Returns an error when the post does not exist or has no assigned
    /// categories (the host stand-in has no site-wide default term).
    pub fn resolve_category(&self, post_id: PostId) -> Result<Selection> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let mut selector = CategorySelector::new(&store);
        let (_, selection) = self.resolve_one(&store, &mut selector, post_id)?;
        Ok(selection)
    }

    /// Render one post's permalink.
    ///
    /// # Errors
    /// Returns an error when the post does not exist or has no assigned categories.
    pub fn permalink(&self, post_id: PostId) -> Result<PermalinkResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let mut selector = CategorySelector::new(&store);
        self.permalink_one(&store, &mut selector, post_id)
    }

    /// Render permalinks for several posts inside one request scope: a single
    /// selector (and therefore a single memo) spans the whole batch, so every
    /// URL built for the same post agrees.
    ///
    /// # Errors
    /// Returns an error when any post does not exist or has no assigned categories.
    pub fn permalinks(&self, post_ids: &[PostId]) -> Result<Vec<PermalinkResult>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let mut selector = CategorySelector::new(&store);

        let mut results = Vec::with_capacity(post_ids.len());
        for post_id in post_ids {
            results.push(self.permalink_one(&store, &mut selector, *post_id)?);
        }
        Ok(results)
    }

    fn permalink_one(
        &self,
        store: &SqliteStore,
        selector: &mut CategorySelector<&SqliteStore>,
        post_id: PostId,
    ) -> Result<PermalinkResult> {
        let (post, selection) = self.resolve_one(store, selector, post_id)?;
        let permalink = self.structure.render(&post, &selection.category);
        Ok(PermalinkResult { post, permalink, selection })
    }

    fn resolve_one(
        &self,
        store: &SqliteStore,
        selector: &mut CategorySelector<&SqliteStore>,
        post_id: PostId,
    ) -> Result<(Post, Selection)> {
        let post = store
            .post(post_id)?
            .ok_or_else(|| anyhow!("post not found: {post_id}"))?;
        let assigned = store.assigned_categories(post_id)?;
        let host_default = assigned
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("post {post_id} has no assigned categories"))?;

        let selection = if self.active {
            selector.select(post_id, &assigned, host_default)
        } else {
            Selection {
                category: host_default,
                source: SelectionSource::HostDefault,
                memoized: false,
                reasons: vec![
                    "permalink structure has no %category% placeholder; override inactive"
                        .to_string(),
                ],
            }
        };
        debug!(post = %post_id, category = %selection.category.id, source = selection.source.as_str(), "category resolved");

        Ok((post, selection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("permalink-pin-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn api_at(db_path: &std::path::Path, pattern: &str) -> PermalinkPinApi {
        PermalinkPinApi::new(db_path.to_path_buf(), PermalinkStructure::new(pattern))
    }

    fn seed(api: &PermalinkPinApi, term_names: &[&str]) -> (Post, Vec<Category>) {
        let mut categories = Vec::new();
        for name in term_names {
            let category = match api.term_add(TermAddRequest { name: (*name).to_string(), slug: None }) {
                Ok(category) => category,
                Err(err) => panic!("term should insert: {err}"),
            };
            categories.push(category);
        }
        let post = match api.post_add(PostAddRequest {
            title: "Launch Day".to_string(),
            slug: None,
            term_ids: categories.iter().map(|category| category.id).collect(),
        }) {
            Ok(post) => post,
            Err(err) => panic!("post should insert: {err}"),
        };
        (post, categories)
    }

    fn save(api: &PermalinkPinApi, post_id: PostId, submitted: Option<&str>) -> SavePreferenceResult {
        match api.save_preference(SavePreferenceRequest {
            post_id,
            submitted: submitted.map(ToString::to_string),
            autosave: false,
            can_edit: true,
        }) {
            Ok(result) => result,
            Err(err) => panic!("save should not error: {err}"),
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn save_then_resolve_honors_the_pinned_category() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%category%/%postname%/");
        let (post, categories) = seed(&api, &["News", "Sports"]);

        let saved = save(&api, post.id, Some(&categories[1].id.to_string()));
        assert_eq!(saved.outcome, SaveOutcome::Stored);

        let selection = api.resolve_category(post.id)?;
        assert_eq!(selection.category, categories[1]);
        assert_eq!(selection.source, SelectionSource::Pinned);

        let rendered = api.permalink(post.id)?;
        assert_eq!(rendered.permalink, "/sports/launch-day/");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn stale_preference_resolves_to_host_default() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%category%/%postname%/");
        let (post, categories) = seed(&api, &["News", "Sports", "Tech"]);

        let saved = save(&api, post.id, Some("99"));
        assert_eq!(saved.outcome, SaveOutcome::Stored);

        let selection = api.resolve_category(post.id)?;
        assert_eq!(selection.category, categories[0]);
        assert_eq!(selection.source, SelectionSource::HostDefault);

        let status = api.preference_show(post.id)?;
        assert_eq!(status.stored, Some(TermId(99)));
        assert_eq!(status.valid, Some(false));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn save_skip_matrix_never_touches_the_store() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%category%/%postname%/");
        let (post, categories) = seed(&api, &["News", "Sports"]);

        let autosave = api.save_preference(SavePreferenceRequest {
            post_id: post.id,
            submitted: Some(categories[1].id.to_string()),
            autosave: true,
            can_edit: true,
        })?;
        assert_eq!(autosave.outcome, SaveOutcome::SkippedAutosave);

        let no_permission = api.save_preference(SavePreferenceRequest {
            post_id: post.id,
            submitted: Some(categories[1].id.to_string()),
            autosave: false,
            can_edit: false,
        })?;
        assert_eq!(no_permission.outcome, SaveOutcome::SkippedPermission);

        assert_eq!(save(&api, post.id, None).outcome, SaveOutcome::SkippedMissingField);
        assert_eq!(save(&api, post.id, Some("")).outcome, SaveOutcome::SkippedMissingField);
        assert_eq!(save(&api, post.id, Some("abc")).outcome, SaveOutcome::SkippedInvalidValue);
        assert_eq!(save(&api, post.id, Some("0")).outcome, SaveOutcome::SkippedInvalidValue);

        assert_eq!(api.preference_show(post.id)?.stored, None);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn structure_without_category_placeholder_deactivates_the_override() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%year%/%postname%/");
        assert!(!api.is_active());

        let (post, categories) = seed(&api, &["News", "Sports"]);
        let _ = save(&api, post.id, Some(&categories[1].id.to_string()));

        let selection = api.resolve_category(post.id)?;
        assert_eq!(selection.category, categories[0]);
        assert!(selection.reasons.iter().any(|reason| reason.contains("%category%")));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn batch_permalinks_share_one_memo() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%category%/%postname%/");
        let (post, categories) = seed(&api, &["News", "Sports"]);
        let _ = save(&api, post.id, Some(&categories[1].id.to_string()));

        let results = api.permalinks(&[post.id, post.id])?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].selection.category, results[1].selection.category);
        assert!(!results[0].selection.memoized);
        assert!(results[1].selection.memoized);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn preference_options_degenerate_cases_render_messages() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%category%/%postname%/");

        let lonely = match api.post_add(PostAddRequest {
            title: "Unfiled".to_string(),
            slug: None,
            term_ids: Vec::new(),
        }) {
            Ok(post) => post,
            Err(err) => panic!("post should insert: {err}"),
        };
        let none = api.preference_options(lonely.id)?;
        assert!(!none.control);
        assert_eq!(none.message.as_deref(), Some("No categories selected."));

        let (post, categories) = seed(&api, &["News", "Sports"]);
        let _ = save(&api, post.id, Some(&categories[1].id.to_string()));
        let options = api.preference_options(post.id)?;
        assert!(options.control);
        assert_eq!(options.options.len(), 3);
        assert_eq!(options.options[0].label, "Default Category");
        assert!(!options.options[0].selected);
        assert!(options.options[2].selected);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn resolving_a_post_without_categories_is_an_error() {
        let db_path = unique_temp_db_path();
        let api = api_at(&db_path, "/%category%/%postname%/");
        let post = match api.post_add(PostAddRequest {
            title: "Unfiled".to_string(),
            slug: None,
            term_ids: Vec::new(),
        }) {
            Ok(post) => post,
            Err(err) => panic!("post should insert: {err}"),
        };

        let err = match api.resolve_category(post.id) {
            Ok(_) => panic!("resolution should fail without categories"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("no assigned categories"));

        let _ = std::fs::remove_file(&db_path);
    }
}
