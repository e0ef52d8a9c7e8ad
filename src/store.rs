use crate::notify::FavoritesObserver;
use crate::record::{DictsData, ImportRecord, Timestamp, WordPatch, WordRecord};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    /// The backing file could not be opened or parsed.
    Unavailable(String),
    /// A mutation could not be persisted; the in-memory state was rolled back.
    WriteFailure(String),
    MalformedInput(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(reason) => write!(f, "word store unavailable: {reason}"),
            StoreError::WriteFailure(reason) => write!(f, "word store write failed: {reason}"),
            StoreError::MalformedInput(reason) => write!(f, "malformed input: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Secondary query over the record set. Unset filters match everything.
#[derive(Debug, Clone, Default)]
pub struct WordQuery {
    pub favorite: Option<bool>,
    pub checked: Option<bool>,
    pub created_since: Option<Timestamp>,
    pub updated_since: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl WordQuery {
    pub fn favorites() -> Self {
        Self {
            favorite: Some(true),
            ..Self::default()
        }
    }

    fn matches(&self, record: &WordRecord) -> bool {
        self.favorite.is_none_or(|v| record.status_favorite == v)
            && self.checked.is_none_or(|v| record.status_checked == v)
            && self.created_since.is_none_or(|t| record.created_at >= t)
            && self.updated_since.is_none_or(|t| record.updated_at >= t)
    }
}

/// Keyed word store. Cloning is cheap and every clone shares the same state.
///
/// Every mutation runs its read-modify-write under one write lock and is
/// persisted before the lock is released, so concurrent upserts of the same
/// key never lose an update and the snapshot on disk never goes backwards.
#[derive(Clone)]
pub struct StoreEngine {
    shared: Arc<StoreShared>,
    observer: Option<Arc<dyn FavoritesObserver>>,
}

struct StoreShared {
    inner: RwLock<StoreState>,
    persistence: StorePersistence,
}

#[derive(Default)]
struct StoreState {
    words: BTreeMap<String, WordRecord>,
    dicts: DictsData,
}

impl StoreEngine {
    /// Opens (or creates) a store backed by a JSON snapshot at `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let persistence = StorePersistence::new(Some(path.into()));
        let state = persistence.load()?;
        Ok(Self::from_parts(state, persistence))
    }

    pub fn ephemeral() -> Self {
        Self::from_parts(StoreState::default(), StorePersistence::new(None))
    }

    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        match path {
            Some(path) => Self::persistent(path),
            None => Ok(Self::ephemeral()),
        }
    }

    fn from_parts(state: StoreState, persistence: StorePersistence) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                inner: RwLock::new(state),
                persistence,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FavoritesObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn upsert(&self, patch: WordPatch) -> Result<WordRecord, StoreError> {
        let key = patch.word.trim().to_string();
        if key.is_empty() {
            return Err(StoreError::MalformedInput("`word` must not be empty"));
        }
        let touches_favorite = patch.touches_favorite();
        let now = Utc::now();

        let mut guard = self.shared.inner.write();
        let previous = guard.words.get(&key).cloned();
        let record = match previous.clone() {
            Some(mut existing) => {
                existing.merge(patch, now);
                existing
            }
            None => WordRecord::create(key.clone(), patch, now),
        };
        guard.words.insert(key.clone(), record.clone());
        if let Err(err) = self.shared.persistence.write(&guard) {
            match previous {
                Some(previous) => {
                    guard.words.insert(key, previous);
                }
                None => {
                    guard.words.remove(&key);
                }
            }
            return Err(err);
        }
        drop(guard);

        debug!(
            word = %record.word,
            count = record.occurrence_count,
            favorite = record.status_favorite,
            "upserted word"
        );
        if touches_favorite {
            self.notify_favorites_changed();
        }
        Ok(record)
    }

    /// Looks a word up by its literal form, then lower, upper and title case.
    pub fn get(&self, word: &str) -> Option<WordRecord> {
        let guard = self.shared.inner.read();
        lookup_candidates(word)
            .iter()
            .find_map(|candidate| guard.words.get(candidate).cloned())
    }

    /// Removes the record stored under exactly `word`.
    pub fn delete(&self, word: &str) -> Result<Option<WordRecord>, StoreError> {
        let mut guard = self.shared.inner.write();
        let Some(removed) = guard.words.remove(word) else {
            return Ok(None);
        };
        if let Err(err) = self.shared.persistence.write(&guard) {
            guard.words.insert(word.to_string(), removed);
            return Err(err);
        }
        drop(guard);

        debug!(word = %removed.word, "deleted word");
        if removed.status_favorite {
            self.notify_favorites_changed();
        }
        Ok(Some(removed))
    }

    pub fn list_favorites(&self) -> Vec<WordRecord> {
        self.query(&WordQuery::favorites())
    }

    pub fn list_all(&self) -> Vec<WordRecord> {
        self.query(&WordQuery::default())
    }

    pub fn query(&self, query: &WordQuery) -> Vec<WordRecord> {
        let guard = self.shared.inner.read();
        guard
            .words
            .values()
            .filter(|record| query.matches(record))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Replaces records wholesale under their lowercased keys. Entries without
    /// a usable word are skipped. Returns how many records were written.
    pub fn bulk_import<I>(&self, entries: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = ImportRecord>,
    {
        let now = Utc::now();
        let records: Vec<WordRecord> = entries
            .into_iter()
            .filter_map(|entry| entry.into_record(now))
            .collect();

        let mut guard = self.shared.inner.write();
        let backup = guard.words.clone();
        let mut written = 0usize;
        for record in records {
            guard.words.insert(record.word.clone(), record);
            written += 1;
        }
        if let Err(err) = self.shared.persistence.write(&guard) {
            guard.words = backup;
            return Err(err);
        }
        drop(guard);

        info!(written, "bulk import finished");
        self.notify_favorites_changed();
        Ok(written)
    }

    pub fn dicts_data(&self) -> DictsData {
        self.shared.inner.read().dicts.clone()
    }

    pub fn set_dicts_data(&self, data: DictsData) -> Result<(), StoreError> {
        let mut guard = self.shared.inner.write();
        let backup = guard.dicts.clone();
        guard.dicts.merge_from(data);
        if let Err(err) = self.shared.persistence.write(&guard) {
            guard.dicts = backup;
            return Err(err);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shared.inner.read().words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.persistence.path.as_deref()
    }

    fn notify_favorites_changed(&self) {
        if let Some(observer) = &self.observer {
            observer.favorites_changed();
        }
    }
}

fn lookup_candidates(word: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(4);
    for candidate in [
        word.to_string(),
        word.to_lowercase(),
        word.to_uppercase(),
        title_case(word),
    ] {
        if !candidate.is_empty() && !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

struct StorePersistence {
    path: Option<PathBuf>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    words: Vec<&'a WordRecord>,
    dicts: &'a DictsData,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    words: Vec<WordRecord>,
    #[serde(default)]
    dicts: DictsData,
}

impl StorePersistence {
    fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<StoreState, StoreError> {
        let Some(path) = &self.path else {
            return Ok(StoreState::default());
        };
        if !path.exists() {
            info!(path = %path.display(), "creating new word store");
            return Ok(StoreState::default());
        }
        let bytes = fs::read(path)
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", path.display())))?;
        if snapshot.version > SNAPSHOT_VERSION {
            warn!(
                version = snapshot.version,
                supported = SNAPSHOT_VERSION,
                "word store snapshot is newer than this build"
            );
        }
        let mut state = StoreState {
            words: BTreeMap::new(),
            dicts: snapshot.dicts,
        };
        for record in snapshot.words {
            if record.word.is_empty() {
                warn!("skipping stored record without a word");
                continue;
            }
            state.words.insert(record.word.clone(), record);
        }
        info!(path = %path.display(), words = state.words.len(), "loaded word store");
        Ok(state)
    }

    fn write(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            words: state.words.values().collect(),
            dicts: &state.dicts,
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|err| StoreError::WriteFailure(err.to_string()))?;
        write_atomically(path, &bytes).map_err(|err| {
            warn!(path = %path.display(), error = %err, "failed to persist word store");
            StoreError::WriteFailure(err.to_string())
        })
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChangeNotifier;
    use rand::{Rng, thread_rng};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        calls: AtomicUsize,
    }

    impl FavoritesObserver for CountingObserver {
        fn favorites_changed(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn observed() -> (StoreEngine, Arc<CountingObserver>) {
        let observer = Arc::new(CountingObserver::default());
        let store = StoreEngine::ephemeral().with_observer(observer.clone());
        (store, observer)
    }

    /// A persistent store whose every later write fails: the `.tmp` sibling
    /// of the snapshot is a directory, so it cannot be created as a file.
    fn failing_store(dir: &Path) -> (StoreEngine, Arc<CountingObserver>) {
        let path = dir.join("words.json");
        let observer = Arc::new(CountingObserver::default());
        let store = StoreEngine::persistent(&path)
            .unwrap()
            .with_observer(observer.clone());
        store
            .upsert(WordPatch::new("kept").meaning("before").favorite(true))
            .unwrap();
        store
            .set_dicts_data(DictsData {
                dicts_word: Some("kept".into()),
                ..DictsData::default()
            })
            .unwrap();
        fs::create_dir(dir.join("words.json.tmp")).unwrap();
        observer.calls.store(0, Ordering::SeqCst);
        (store, observer)
    }

    fn import(values: serde_json::Value) -> Vec<ImportRecord> {
        serde_json::from_value(values).unwrap()
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let store = StoreEngine::ephemeral();
        store
            .upsert(WordPatch::new("apple").meaning("fruit"))
            .unwrap();
        let record = store.get("apple").unwrap();
        assert_eq!(record.occurrence_count, 1);
        assert_eq!(record.meaning.as_deref(), Some("fruit"));
        assert!(!record.status_favorite);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn upsert_merges_and_counts() {
        let store = StoreEngine::ephemeral();
        store
            .upsert(WordPatch::new("apple").meaning("fruit"))
            .unwrap();
        let merged = store.upsert(WordPatch::new("apple").favorite(true)).unwrap();
        assert_eq!(merged.meaning.as_deref(), Some("fruit"));
        assert!(merged.status_favorite);
        assert_eq!(merged.occurrence_count, 2);
        assert!(merged.updated_at >= merged.created_at);

        let cleared = store.upsert(WordPatch::new("apple").favorite(false)).unwrap();
        assert!(!cleared.status_favorite);
        assert_eq!(cleared.occurrence_count, 3);
    }

    #[test]
    fn upsert_trims_and_rejects_blank_words() {
        let store = StoreEngine::ephemeral();
        let record = store.upsert(WordPatch::new("  pear \n")).unwrap();
        assert_eq!(record.word, "pear");
        assert!(matches!(
            store.upsert(WordPatch::new("   ")),
            Err(StoreError::MalformedInput(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lookup_tries_each_casing() {
        let store = StoreEngine::ephemeral();
        store.upsert(WordPatch::new("Apple")).unwrap();
        for query in ["apple", "APPLE", "Apple", "aPPLE"] {
            assert_eq!(store.get(query).map(|r| r.word), Some("Apple".to_string()));
        }
        store.upsert(WordPatch::new("NASA")).unwrap();
        assert!(store.get("nasa").is_some());
        assert!(store.get("missing").is_none());
        assert!(store.get("").is_none());
    }

    #[test]
    fn lookup_prefers_literal_key() {
        let store = StoreEngine::ephemeral();
        store.upsert(WordPatch::new("polish").meaning("shine")).unwrap();
        store
            .upsert(WordPatch::new("Polish").meaning("from Poland"))
            .unwrap();
        assert_eq!(
            store.get("Polish").unwrap().meaning.as_deref(),
            Some("from Poland")
        );
        assert_eq!(store.get("POLISH").unwrap().meaning.as_deref(), Some("shine"));
    }

    #[test]
    fn delete_uses_literal_key_only() {
        let store = StoreEngine::ephemeral();
        store.upsert(WordPatch::new("Apple")).unwrap();
        assert!(store.delete("apple").unwrap().is_none());
        assert!(store.get("Apple").is_some());
        let removed = store.delete("Apple").unwrap().unwrap();
        assert_eq!(removed.word, "Apple");
        assert!(store.is_empty());
    }

    #[test]
    fn favorites_listing_matches_flags_exactly() {
        let store = StoreEngine::ephemeral();
        let mut rng = thread_rng();
        let mut expected = Vec::new();
        for idx in 0..40 {
            let word = format!("word{idx}");
            let favorite = rng.gen_bool(0.4);
            if favorite {
                expected.push(word.clone());
            }
            store.upsert(WordPatch::new(&word).favorite(favorite)).unwrap();
        }
        let mut listed: Vec<_> = store
            .list_favorites()
            .into_iter()
            .map(|record| record.word)
            .collect();
        listed.sort();
        expected.sort();
        assert_eq!(listed, expected);
        assert_eq!(store.list_all().len(), 40);
    }

    #[test]
    fn query_filters_by_checked_and_time() {
        let store = StoreEngine::ephemeral();
        store.upsert(WordPatch::new("a").checked(true)).unwrap();
        store.upsert(WordPatch::new("b")).unwrap();
        let checked = store.query(&WordQuery {
            checked: Some(true),
            ..WordQuery::default()
        });
        assert_eq!(checked.len(), 1);
        assert_eq!(checked[0].word, "a");

        let future = Utc::now() + chrono::Duration::days(1);
        let recent = store.query(&WordQuery {
            updated_since: Some(future),
            ..WordQuery::default()
        });
        assert!(recent.is_empty());

        let limited = store.query(&WordQuery {
            limit: Some(1),
            ..WordQuery::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn bulk_import_lowercases_and_replaces() {
        let store = StoreEngine::ephemeral();
        let written = store
            .bulk_import(import(json!([{ "word": "Cat", "meaning": "feline", "occurrenceCount": 7 }])))
            .unwrap();
        assert_eq!(written, 1);
        let record = store.get("cat").unwrap();
        assert_eq!(record.word, "cat");
        assert_eq!(record.occurrence_count, 7);

        store
            .bulk_import(import(json!([{ "word": "cat", "statusFavorite": true }])))
            .unwrap();
        let replaced = store.get("cat").unwrap();
        assert_eq!(replaced.meaning, None);
        assert_eq!(replaced.occurrence_count, 1);
        assert!(replaced.status_favorite);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn bulk_import_skips_entries_without_words() {
        let (store, observer) = observed();
        let written = store
            .bulk_import(import(json!([
                { "word": "dog" },
                { "meaning": "orphan" },
                { "word": "  " },
                { "word": "Owl", "statusFavorite": true },
            ])))
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.list_favorites().len(), 1);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_fires_only_for_favorite_changes() {
        let (store, observer) = observed();
        store.upsert(WordPatch::new("a").meaning("x")).unwrap();
        assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
        store.upsert(WordPatch::new("a").favorite(true)).unwrap();
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        store.upsert(WordPatch::new("b").checked(true)).unwrap();
        store.delete("b").unwrap();
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        store.delete("a").unwrap();
        assert_eq!(observer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn notifier_failure_does_not_fail_write() {
        let notifier = Arc::new(ChangeNotifier::new());
        let (_, receiver) = notifier.subscribe(1);
        drop(receiver);
        let store = StoreEngine::ephemeral().with_observer(notifier.clone());
        assert!(store.upsert(WordPatch::new("kept").favorite(true)).is_ok());
        assert_eq!(notifier.page_count(), 0);
        assert!(store.get("kept").is_some());
    }

    #[test]
    fn concurrent_upserts_to_one_key_are_not_lost() {
        let store = StoreEngine::ephemeral();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        store.upsert(WordPatch::new("race")).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.get("race").unwrap().occurrence_count, 400);
    }

    #[test]
    fn dicts_data_round_trips() {
        let store = StoreEngine::ephemeral();
        assert_eq!(store.dicts_data(), DictsData::default());
        store
            .set_dicts_data(DictsData {
                dicts_word: Some("apple".into()),
                dicts_meaning: Some("fruit".into()),
                ..DictsData::default()
            })
            .unwrap();
        store
            .set_dicts_data(DictsData {
                dicts_count: Some(2),
                ..DictsData::default()
            })
            .unwrap();
        let bag = store.dicts_data();
        assert_eq!(bag.dicts_word.as_deref(), Some("apple"));
        assert_eq!(bag.dicts_count, Some(2));
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("words.json");
        {
            let store = StoreEngine::persistent(&path).unwrap();
            store
                .upsert(WordPatch::new("apple").meaning("fruit").favorite(true))
                .unwrap();
            store.upsert(WordPatch::new("gone")).unwrap();
            store.delete("gone").unwrap();
            store
                .set_dicts_data(DictsData {
                    dicts_word: Some("apple".into()),
                    ..DictsData::default()
                })
                .unwrap();
        }
        let reopened = StoreEngine::persistent(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        let record = reopened.get("apple").unwrap();
        assert_eq!(record.meaning.as_deref(), Some("fruit"));
        assert!(record.status_favorite);
        assert_eq!(reopened.dicts_data().dicts_word.as_deref(), Some("apple"));
    }

    #[test]
    fn corrupt_snapshot_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            StoreEngine::persistent(&path),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn failed_upsert_rolls_back_and_stays_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let (store, observer) = failing_store(dir.path());

        let err = store
            .upsert(WordPatch::new("kept").meaning("after").favorite(false))
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteFailure(_)));
        let record = store.get("kept").unwrap();
        assert_eq!(record.meaning.as_deref(), Some("before"));
        assert_eq!(record.occurrence_count, 1);
        assert!(record.status_favorite);

        assert!(matches!(
            store.upsert(WordPatch::new("fresh").favorite(true)),
            Err(StoreError::WriteFailure(_))
        ));
        assert!(store.get("fresh").is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_delete_restores_record() {
        let dir = tempfile::tempdir().unwrap();
        let (store, observer) = failing_store(dir.path());
        assert!(matches!(
            store.delete("kept"),
            Err(StoreError::WriteFailure(_))
        ));
        assert!(store.get("kept").unwrap().status_favorite);
        assert_eq!(store.list_favorites().len(), 1);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_import_and_bag_write_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let (store, observer) = failing_store(dir.path());
        assert!(matches!(
            store.bulk_import(import(json!([{ "word": "kept" }, { "word": "new" }]))),
            Err(StoreError::WriteFailure(_))
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("kept").unwrap().meaning.as_deref(), Some("before"));

        assert!(matches!(
            store.set_dicts_data(DictsData {
                dicts_word: Some("other".into()),
                dicts_count: Some(9),
                ..DictsData::default()
            }),
            Err(StoreError::WriteFailure(_))
        ));
        let bag = store.dicts_data();
        assert_eq!(bag.dicts_word.as_deref(), Some("kept"));
        assert_eq!(bag.dicts_count, None);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn title_case_handles_unicode() {
        assert_eq!(title_case("éCOLE"), "École");
        assert_eq!(title_case(""), "");
        assert_eq!(lookup_candidates("a"), vec!["a".to_string(), "A".to_string()]);
    }
}
