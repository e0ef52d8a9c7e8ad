use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// A persisted vocabulary entry, keyed by its `word`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordRecord {
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meaning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub status_checked: bool,
    #[serde(default)]
    pub status_favorite: bool,
    pub occurrence_count: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WordRecord {
    pub(crate) fn create(word: String, patch: WordPatch, now: Timestamp) -> Self {
        Self {
            word,
            meaning: patch.meaning,
            image: patch.image,
            status_checked: patch.status_checked.unwrap_or(false),
            status_favorite: patch.status_favorite.unwrap_or(false),
            occurrence_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Field-wise merge: only fields present in `patch` overwrite.
    pub(crate) fn merge(&mut self, patch: WordPatch, now: Timestamp) {
        if let Some(meaning) = patch.meaning {
            self.meaning = Some(meaning);
        }
        if let Some(image) = patch.image {
            self.image = Some(image);
        }
        if let Some(checked) = patch.status_checked {
            self.status_checked = checked;
        }
        if let Some(favorite) = patch.status_favorite {
            self.status_favorite = favorite;
        }
        self.occurrence_count = self.occurrence_count.saturating_add(1);
        self.updated_at = now.max(self.created_at);
    }
}

/// Partial record used by upserts. `None` means "leave the stored value alone",
/// which is how an omitted `false` is told apart from an explicit one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordPatch {
    #[serde(default)]
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meaning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_checked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_favorite: Option<bool>,
}

impl WordPatch {
    pub fn new(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            ..Self::default()
        }
    }

    pub fn meaning(mut self, meaning: impl Into<String>) -> Self {
        self.meaning = Some(meaning.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn checked(mut self, checked: bool) -> Self {
        self.status_checked = Some(checked);
        self
    }

    pub fn favorite(mut self, favorite: bool) -> Self {
        self.status_favorite = Some(favorite);
        self
    }

    pub fn touches_favorite(&self) -> bool {
        self.status_favorite.is_some()
    }
}

/// Loosely-typed entry accepted by bulk import. Field names from the legacy
/// `dicts_*` export format are accepted as aliases.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    #[serde(default, alias = "dicts_word")]
    pub word: Option<String>,
    #[serde(default, alias = "dicts_meaning")]
    pub meaning: Option<String>,
    #[serde(default, alias = "dicts_image")]
    pub image: Option<String>,
    #[serde(default, alias = "dicts_status_check")]
    pub status_checked: Option<bool>,
    #[serde(default, alias = "dicts_status_fav")]
    pub status_favorite: Option<bool>,
    #[serde(default, alias = "dicts_count")]
    pub occurrence_count: Option<u64>,
    #[serde(default, alias = "dicts_create_time")]
    pub created_at: Option<Timestamp>,
    #[serde(default, alias = "dicts_update_time")]
    pub updated_at: Option<Timestamp>,
}

impl ImportRecord {
    /// Normalizes the entry into a full record under its lowercased key.
    /// Returns `None` when the word is missing or blank.
    pub fn into_record(self, now: Timestamp) -> Option<WordRecord> {
        let word = self.word?.trim().to_lowercase();
        if word.is_empty() {
            return None;
        }
        let created_at = self.created_at.unwrap_or(now);
        let updated_at = self.updated_at.unwrap_or(now).max(created_at);
        Some(WordRecord {
            word,
            meaning: self.meaning,
            image: self.image,
            status_checked: self.status_checked.unwrap_or(false),
            status_favorite: self.status_favorite.unwrap_or(false),
            occurrence_count: self.occurrence_count.unwrap_or(1).max(1),
            created_at,
            updated_at,
        })
    }
}

/// Whether two spellings name the same word, ignoring case and surrounding
/// whitespace.
pub(crate) fn same_word(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Auxiliary field bag shared between the page and the store. Every field is
/// independently optional; writes only touch the fields that are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictsData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_word: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_meaning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_status_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_status_fav: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicts_update_time: Option<String>,
}

impl DictsData {
    pub fn merge_from(&mut self, other: DictsData) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.dicts_word, other.dicts_word);
        take(&mut self.dicts_meaning, other.dicts_meaning);
        take(&mut self.dicts_image, other.dicts_image);
        take(&mut self.dicts_status_check, other.dicts_status_check);
        take(&mut self.dicts_status_fav, other.dicts_status_fav);
        take(&mut self.dicts_count, other.dicts_count);
        take(&mut self.dicts_create_time, other.dicts_create_time);
        take(&mut self.dicts_update_time, other.dicts_update_time);
    }
}
