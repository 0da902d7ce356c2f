use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PinError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Metadata key under which the pinned category id is stored, one row per post.
pub const PREFERENCE_META_KEY: &str = "category_in_permalink";

/// Pattern token replaced by the selected category slug.
pub const CATEGORY_PLACEHOLDER: &str = "%category%";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PostId(pub i64);

impl PostId {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Display for PostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TermId(pub i64);

impl TermId {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// Parse a stored preference value. Preferences are persisted as
    /// integer-as-string metadata; anything that is not a positive integer
    /// reads as no preference at all.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let parsed = value.trim().parse::<i64>().ok()?;
        (parsed > 0).then_some(Self(parsed))
    }
}

impl Display for TermId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Category {
    pub id: TermId,
    pub name: String,
    pub slug: String,
}

impl Category {
    /// Validate one taxonomy term before it is persisted or rendered.
    ///
    /// # Errors
    /// Returns [`PinError::Validation`] when the id is not positive, the name
    /// is blank, or the slug contains characters that cannot appear in a URL
    /// segment.
    pub fn validate(&self) -> Result<(), PinError> {
        if !self.id.is_valid() {
            return Err(PinError::Validation("term id MUST be a positive integer".to_string()));
        }

        if self.name.trim().is_empty() {
            return Err(PinError::Validation("category name MUST be non-empty".to_string()));
        }

        validate_slug(&self.slug)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub title: String,
    pub slug: String,
}

impl Post {
    /// # Errors
    /// Returns [`PinError::Validation`] when the id is not positive, the
    /// title is blank, or the slug is not a valid URL segment.
    pub fn validate(&self) -> Result<(), PinError> {
        if !self.id.is_valid() {
            return Err(PinError::Validation("post id MUST be a positive integer".to_string()));
        }

        if self.title.trim().is_empty() {
            return Err(PinError::Validation("post title MUST be non-empty".to_string()));
        }

        validate_slug(&self.slug)
    }
}

/// # Errors
/// Returns [`PinError::Validation`] unless the slug is a non-empty run of
/// lowercase ascii, digits, and interior hyphens.
pub fn validate_slug(slug: &str) -> Result<(), PinError> {
    if slug.is_empty() {
        return Err(PinError::Validation("slug MUST be non-empty".to_string()));
    }

    let acceptable = slug
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    if !acceptable || slug.starts_with('-') || slug.ends_with('-') {
        return Err(PinError::Validation(format!(
            "slug `{slug}` MUST contain only lowercase ascii, digits, and interior hyphens"
        )));
    }

    Ok(())
}

/// Derive a URL slug from a display name.
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut previous_hyphen = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            previous_hyphen = false;
        } else if !previous_hyphen {
            slug.push('-');
            previous_hyphen = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}

/// Configured permalink pattern, read once at startup. The category override
/// only activates when the pattern carries the `%category%` placeholder; the
/// scan is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermalinkStructure(String);

impl PermalinkStructure {
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn has_category_placeholder(&self) -> bool {
        self.0.to_ascii_lowercase().contains(CATEGORY_PLACEHOLDER)
    }

    /// Substitute the known placeholders into a concrete permalink. Unknown
    /// text passes through verbatim.
    #[must_use]
    pub fn render(&self, post: &Post, category: &Category) -> String {
        self.0
            .replace(CATEGORY_PLACEHOLDER, &category.slug)
            .replace("%postname%", &post.slug)
            .replace("%post_id%", &post.id.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    HostDefault,
    Pinned,
}

impl SelectionSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostDefault => "host_default",
            Self::Pinned => "pinned",
        }
    }
}

/// Outcome of one permalink-category resolution, with the reasons a reader
/// would need to audit why this category ended up in the URL.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Selection {
    pub category: Category,
    pub source: SelectionSource,
    pub memoized: bool,
    pub reasons: Vec<String>,
}

/// Read side of the Preference Store as seen by the selector. Implementations
/// degrade silently: any failure to read is indistinguishable from "no
/// preference stored".
pub trait PreferenceSource {
    fn preference(&self, post_id: PostId) -> Option<TermId>;
}

impl<T: PreferenceSource + ?Sized> PreferenceSource for &T {
    fn preference(&self, post_id: PostId) -> Option<TermId> {
        (**self).preference(post_id)
    }
}

/// Simple map-backed preference source.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPreferences {
    entries: BTreeMap<PostId, TermId>,
}

impl InMemoryPreferences {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, post_id: PostId, term_id: TermId) {
        self.entries.insert(post_id, term_id);
    }
}

impl PreferenceSource for InMemoryPreferences {
    fn preference(&self, post_id: PostId) -> Option<TermId> {
        self.entries.get(&post_id).copied()
    }
}

/// Decides the single category to embed in a post's permalink.
///
/// One selector value spans one request: the memo keyed by post id guarantees
/// that every URL built for a post within that request uses the same category,
/// even if the assignment set mutates mid-request. Construct it explicitly at
/// the call site that builds permalinks and drop it when the request ends.
pub struct CategorySelector<S> {
    source: S,
    memo: HashMap<PostId, Category>,
}

impl<S: PreferenceSource> CategorySelector<S> {
    pub fn new(source: S) -> Self {
        Self { source, memo: HashMap::new() }
    }

    #[must_use]
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    /// Resolve the category for one post given its currently assigned
    /// categories and the host's own default pick.
    ///
    /// With fewer than two assigned categories there is nothing to override
    /// and the host default comes back unchanged. A stored preference is
    /// honored only when it still names an assigned category; stale values
    /// fall back to the host default and are never memoized, so a later call
    /// in the same request re-checks the store.
    pub fn select(
        &mut self,
        post_id: PostId,
        assigned: &[Category],
        host_default: Category,
    ) -> Selection {
        if assigned.len() < 2 {
            return Selection {
                category: host_default,
                source: SelectionSource::HostDefault,
                memoized: false,
                reasons: vec![
                    "fewer than two assigned categories, nothing to override".to_string(),
                ],
            };
        }

        if let Some(category) = self.memo.get(&post_id) {
            return Selection {
                category: category.clone(),
                source: SelectionSource::Pinned,
                memoized: true,
                reasons: vec!["served from the request-scoped memo".to_string()],
            };
        }

        let Some(pinned) = self.source.preference(post_id) else {
            return Selection {
                category: host_default,
                source: SelectionSource::HostDefault,
                memoized: false,
                reasons: vec!["no stored preference for this post".to_string()],
            };
        };

        match assigned.iter().find(|category| category.id == pinned) {
            Some(category) => {
                self.memo.insert(post_id, category.clone());
                Selection {
                    category: category.clone(),
                    source: SelectionSource::Pinned,
                    memoized: false,
                    reasons: vec![format!(
                        "stored preference {pinned} matches an assigned category"
                    )],
                }
            }
            None => Selection {
                category: host_default,
                source: SelectionSource::HostDefault,
                memoized: false,
                reasons: vec![format!(
                    "stored preference {pinned} no longer names an assigned category"
                )],
            },
        }
    }
}
