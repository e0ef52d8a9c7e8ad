use crate::dom::{Document, NodeId};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::{Regex, RegexBuilder};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

pub const MARKER_CLASS: &str = "glossmark-highlight";
pub const POPUP_CLASS: &str = "glossmark-popup";
pub const WORD_ATTRIBUTE: &str = "data-word";
pub const STYLE_CLASS: &str = "glossmark-style";

const MARKER_STYLESHEET: &str = "\
.glossmark-highlight { background-color: #ffeb3b; border-radius: 2px; padding: 0 2px; cursor: pointer; }
.glossmark-highlight:hover { background-color: #ffc107; }
";

const PATTERN_SIZE_LIMIT: usize = 64 << 20;

static SKIPPED_TAGS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["script", "style", "noscript", "svg"].into_iter().collect());

/// Lowercased words eligible for highlighting on a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FavoriteSet {
    words: BTreeSet<String>,
}

impl FavoriteSet {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        words.into_iter().collect()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.words.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for FavoriteSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let words = iter
            .into_iter()
            .map(|word| word.as_ref().trim().to_lowercase())
            .filter(|word| !word.is_empty())
            .collect();
        Self { words }
    }
}

#[derive(Debug)]
pub struct HighlightError(regex::Error);

impl fmt::Display for HighlightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to build word matcher: {}", self.0)
    }
}

impl std::error::Error for HighlightError {}

impl From<regex::Error> for HighlightError {
    fn from(value: regex::Error) -> Self {
        HighlightError(value)
    }
}

/// A match inside one text node; `start..end` are byte offsets into the
/// node's text and `word` is the matched text lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordMatch {
    pub start: usize,
    pub end: usize,
    pub word: String,
}

/// Whole-word, case-insensitive matcher over a [`FavoriteSet`].
///
/// All words are compiled into one alternation, longest first, so a single
/// pass yields disjoint matches and a longer favorite wins over a shorter one
/// starting at the same position.
pub struct WordMatcher {
    regex: Option<Regex>,
}

impl WordMatcher {
    pub fn new(favorites: &FavoriteSet) -> Result<Self, HighlightError> {
        if favorites.is_empty() {
            return Ok(Self { regex: None });
        }
        let mut words: Vec<&str> = favorites.iter().collect();
        words.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let alternation = words
            .iter()
            .map(|word| word_pattern(word))
            .collect::<Vec<_>>()
            .join("|");
        let regex = RegexBuilder::new(&format!("(?:{alternation})"))
            .case_insensitive(true)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()?;
        Ok(Self { regex: Some(regex) })
    }

    pub fn find(&self, text: &str) -> Vec<WordMatch> {
        let Some(regex) = &self.regex else {
            return Vec::new();
        };
        regex
            .find_iter(text)
            .map(|m| WordMatch {
                start: m.start(),
                end: m.end(),
                word: m.as_str().to_lowercase(),
            })
            .collect()
    }
}

// Boundary assertions only make sense on edges that are word characters;
// "c++" must still match before a space.
fn word_pattern(word: &str) -> String {
    let escaped = regex::escape(word);
    let lead = if word.chars().next().is_some_and(is_word_char) {
        r"\b"
    } else {
        ""
    };
    let trail = if word.chars().next_back().is_some_and(is_word_char) {
        r"\b"
    } else {
        ""
    };
    format!("{lead}{escaped}{trail}")
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HighlightReport {
    pub scanned_nodes: usize,
    pub annotated_nodes: usize,
    pub markers_created: usize,
    pub markers_removed: usize,
}

/// A highlighted occurrence currently in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub node: NodeId,
    pub word: String,
}

struct NodePlan {
    node: NodeId,
    text: String,
    matches: Vec<WordMatch>,
}

pub struct HighlightEngine {
    favorites: FavoriteSet,
    matcher: WordMatcher,
}

impl HighlightEngine {
    pub fn new(favorites: FavoriteSet) -> Result<Self, HighlightError> {
        let matcher = WordMatcher::new(&favorites)?;
        Ok(Self { favorites, matcher })
    }

    pub fn favorites(&self) -> &FavoriteSet {
        &self.favorites
    }

    pub fn matcher(&self) -> &WordMatcher {
        &self.matcher
    }

    /// Rescans the document from scratch: every marker is unwrapped and the
    /// restored text is matched again, so the result is the same markup a
    /// freshly loaded page would get.
    pub fn annotate(&self, doc: &mut Document) -> HighlightReport {
        let markers_removed = remove_markers(doc, |_| true);
        self.scan(doc, markers_removed)
    }

    /// Cheaper pass for when the favorite set is the one the existing markers
    /// were built from. Markers for words outside the set are unwrapped and
    /// only unmarked text is scanned.
    pub fn refresh(&self, doc: &mut Document) -> HighlightReport {
        let markers_removed = remove_markers(doc, |word| !self.favorites.contains(word));
        self.scan(doc, markers_removed)
    }

    fn scan(&self, doc: &mut Document, markers_removed: usize) -> HighlightReport {
        let snapshot = collect_text_nodes(doc);
        let scanned_nodes = snapshot.len();
        let plans: Vec<NodePlan> = snapshot
            .into_par_iter()
            .filter_map(|(node, text)| {
                let matches = self.matcher.find(&text);
                (!matches.is_empty()).then_some(NodePlan {
                    node,
                    text,
                    matches,
                })
            })
            .collect();

        let annotated_nodes = plans.len();
        let mut markers_created = 0;
        for plan in plans {
            markers_created += apply_plan(doc, plan);
        }
        let report = HighlightReport {
            scanned_nodes,
            annotated_nodes,
            markers_created,
            markers_removed,
        };
        debug!(
            scanned = report.scanned_nodes,
            annotated = report.annotated_nodes,
            created = report.markers_created,
            removed = report.markers_removed,
            "highlight pass finished"
        );
        report
    }
}

/// Text nodes eligible for matching, with their text, in document order.
pub fn collect_text_nodes(doc: &Document) -> Vec<(NodeId, String)> {
    let Some(body) = doc.body() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        if let Some(text) = doc.text(node) {
            if !text.trim().is_empty() {
                out.push((node, text.to_string()));
            }
            continue;
        }
        if is_excluded_subtree(doc, node) {
            continue;
        }
        stack.extend(doc.children(node).iter().rev().copied());
    }
    out
}

fn is_excluded_subtree(doc: &Document, node: NodeId) -> bool {
    doc.tag(node).is_some_and(|tag| SKIPPED_TAGS.contains(tag))
        || doc.has_class(node, MARKER_CLASS)
        || doc.has_class(node, POPUP_CLASS)
}

fn apply_plan(doc: &mut Document, plan: NodePlan) -> usize {
    let NodePlan {
        node,
        text,
        matches,
    } = plan;
    let created = matches.len();
    let mut pieces = Vec::with_capacity(matches.len() * 2 + 1);
    let mut cursor = 0;
    for found in matches {
        if found.start > cursor {
            pieces.push(doc.create_text(&text[cursor..found.start]));
        }
        let marker = doc.create_element("span");
        doc.add_class(marker, MARKER_CLASS);
        doc.set_attribute(marker, WORD_ATTRIBUTE, &found.word);
        let inner = doc.create_text(&text[found.start..found.end]);
        doc.append_child(marker, inner);
        pieces.push(marker);
        cursor = found.end;
    }
    if cursor < text.len() {
        pieces.push(doc.create_text(&text[cursor..]));
    }
    doc.replace_with(node, &pieces);
    created
}

/// Adds the marker stylesheet to the body unless it is already there.
/// Returns the new `style` element.
pub fn ensure_stylesheet(doc: &mut Document) -> Option<NodeId> {
    let body = doc.body()?;
    if !doc.elements_with_class(body, STYLE_CLASS).is_empty() {
        return None;
    }
    let style = doc.append_element(body, "style");
    doc.add_class(style, STYLE_CLASS);
    doc.append_text(style, MARKER_STYLESHEET);
    Some(style)
}

/// Every marker reachable from the body.
pub fn markers(doc: &Document) -> Vec<Marker> {
    let Some(body) = doc.body() else {
        return Vec::new();
    };
    doc.elements_with_class(body, MARKER_CLASS)
        .into_iter()
        .map(|node| Marker {
            node,
            word: doc.attribute(node, WORD_ATTRIBUTE).unwrap_or_default().to_string(),
        })
        .collect()
}

/// Unwraps markers whose word satisfies `remove`, restoring plain text.
pub fn remove_markers(doc: &mut Document, remove: impl Fn(&str) -> bool) -> usize {
    let mut removed = 0;
    for marker in markers(doc) {
        if !remove(&marker.word) {
            continue;
        }
        let Some(parent) = doc.parent(marker.node) else {
            continue;
        };
        let children = doc.children(marker.node).to_vec();
        doc.replace_with(marker.node, &children);
        doc.normalize(parent);
        removed += 1;
    }
    removed
}
