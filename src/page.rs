use crate::client::{ClientError, StoreClient};
use crate::config::GlossmarkConfig;
use crate::dom::{Document, NodeId};
use crate::highlight::{
    FavoriteSet, HighlightEngine, HighlightError, HighlightReport, MARKER_CLASS, POPUP_CLASS,
    WORD_ATTRIBUTE, ensure_stylesheet, markers,
};
use crate::notify::{PageEvent, PageId};
use crate::popup::{ClickTarget, Position, PopupController, PopupEffect};
use crate::rpc::PageChannel;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const CLOSE_CLASS: &str = "glossmark-popup-close";
pub const MOUNT_CLASS: &str = "glossmark-popup-mount";

pub trait DetailView: Send {
    fn show(&mut self, word: &str, anchor: Position);
    fn hide(&mut self, word: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDetailView;

impl DetailView for NoopDetailView {
    fn show(&mut self, _word: &str, _anchor: Position) {}
    fn hide(&mut self, _word: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    Enter(NodeId),
    Leave(NodeId),
    Click(NodeId),
}

#[derive(Debug)]
pub enum PageInput {
    Pointer(PointerEvent),
    /// The host finished loading (or replaced) the document.
    LoadDocument(Document),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Deferred,
    NoFavorites,
    Highlighted(HighlightReport),
}

#[derive(Debug)]
pub enum PageError {
    Store(ClientError),
    Highlight(HighlightError),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::Store(err) => write!(f, "failed to load favorites: {err}"),
            PageError::Highlight(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PageError {}

impl From<ClientError> for PageError {
    fn from(value: ClientError) -> Self {
        PageError::Store(value)
    }
}

impl From<HighlightError> for PageError {
    fn from(value: HighlightError) -> Self {
        PageError::Highlight(value)
    }
}

enum Target {
    Marker(NodeId, String),
    Popup,
    Outside,
}

pub struct PageContext<V> {
    id: PageId,
    document: Document,
    client: StoreClient,
    events: mpsc::Receiver<PageEvent>,
    controller: PopupController,
    view: V,
    markers: HashMap<NodeId, String>,
    applied: Option<FavoriteSet>,
    popup_node: Option<NodeId>,
    retry_at: Option<Instant>,
    retry_used: bool,
    reinit_delay: Duration,
}

impl<V: DetailView> PageContext<V> {
    pub fn new(channel: PageChannel, document: Document, view: V, config: &GlossmarkConfig) -> Self {
        let PageChannel { id, client, events } = channel;
        Self {
            id,
            document,
            client,
            events,
            controller: PopupController::new(config.hide_delay()),
            view,
            markers: HashMap::new(),
            applied: None,
            popup_node: None,
            retry_at: None,
            retry_used: false,
            reinit_delay: config.reinit_delay(),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn controller(&self) -> &PopupController {
        &self.controller
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn popup_node(&self) -> Option<NodeId> {
        self.popup_node
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Loads the favorite set and brings the document's markers in line with
    /// it. A document without a body schedules at most one delayed retry.
    pub async fn initialize(&mut self, now: Instant) -> Result<InitOutcome, PageError> {
        if !self.document.is_ready() {
            if !self.retry_used {
                self.retry_used = true;
                self.retry_at = Some(now + self.reinit_delay);
                debug!(page = %self.id, delay = ?self.reinit_delay, "document not ready; retry scheduled");
            }
            return Ok(InitOutcome::Deferred);
        }
        self.retry_at = None;

        let records = self.client.get_favorite_words().await?;
        let favorites = FavoriteSet::from_words(records.iter().map(|record| record.word.as_str()));
        let no_favorites = favorites.is_empty();
        let unchanged = self.applied.as_ref() == Some(&favorites);
        let engine = HighlightEngine::new(favorites.clone())?;
        let report = if unchanged {
            engine.refresh(&mut self.document)
        } else {
            engine.annotate(&mut self.document)
        };
        if !no_favorites {
            ensure_stylesheet(&mut self.document);
        }
        self.applied = Some(favorites);

        self.markers = markers(&self.document)
            .into_iter()
            .map(|marker| (marker.node, marker.word))
            .collect();
        if self
            .controller
            .visible_marker()
            .is_some_and(|marker| !self.markers.contains_key(&marker))
        {
            let effects = self.controller.hide();
            self.apply(effects);
        }

        info!(
            page = %self.id,
            favorites = records.len(),
            markers = self.markers.len(),
            "page initialized"
        );
        Ok(if no_favorites {
            InitOutcome::NoFavorites
        } else {
            InitOutcome::Highlighted(report)
        })
    }

    /// Routes a pointer event. Nodes that do not belong to the current
    /// document, such as ones from a replaced page, are ignored.
    pub fn handle_pointer(&mut self, event: PointerEvent, now: Instant) {
        let (PointerEvent::Enter(node) | PointerEvent::Leave(node) | PointerEvent::Click(node)) =
            event;
        if !self.document.owns(node) {
            debug!(page = %self.id, ?event, "pointer event for unknown node ignored");
            return;
        }
        let effects = match event {
            PointerEvent::Enter(node) => match self.resolve(node) {
                Target::Marker(marker, word) => {
                    let rect = self.document.bounding_rect(marker);
                    self.controller.marker_entered(marker, &word, rect)
                }
                Target::Popup => {
                    self.controller.popup_entered();
                    Vec::new()
                }
                Target::Outside => Vec::new(),
            },
            PointerEvent::Leave(node) => {
                match self.resolve(node) {
                    Target::Marker(marker, _) => self.controller.marker_left(marker, now),
                    Target::Popup => self.controller.popup_left(now),
                    Target::Outside => {}
                }
                Vec::new()
            }
            PointerEvent::Click(node) if self.is_close_button(node) => self.controller.hide(),
            PointerEvent::Click(node) => match self.resolve(node) {
                Target::Marker(marker, word) => {
                    let rect = self.document.bounding_rect(marker);
                    self.controller.clicked(ClickTarget::Marker {
                        node: marker,
                        word: &word,
                        rect,
                    })
                }
                Target::Popup => self.controller.clicked(ClickTarget::Popup),
                Target::Outside => self.controller.clicked(ClickTarget::Outside),
            },
        };
        self.apply(effects);
    }

    pub fn tick(&mut self, now: Instant) {
        let effects = self.controller.poll(now);
        self.apply(effects);
    }

    /// Replaces the document, dropping markers and any popup that belonged to
    /// the old one.
    pub fn load_document(&mut self, document: Document) {
        for effect in self.controller.hide() {
            if let PopupEffect::Unmount { word } = effect {
                self.view.hide(&word);
            }
        }
        self.popup_node = None;
        self.markers.clear();
        self.applied = None;
        self.document = document;
    }

    /// Runs until the host closes `input`. Store broadcasts trigger a
    /// re-initialization; a closed broadcast channel only stops that source.
    pub async fn run(mut self, mut input: mpsc::Receiver<PageInput>) -> Self {
        self.reinitialize().await;
        let mut events_open = true;
        loop {
            let hide_at = self.controller.pending_hide().map(|timer| timer.deadline);
            let retry_at = self.retry_at;
            tokio::select! {
                biased;
                event = self.events.recv(), if events_open => match event {
                    Some(PageEvent::FavoritesChanged) => {
                        debug!(page = %self.id, "favorites changed");
                        self.reinitialize().await;
                    }
                    None => {
                        info!(page = %self.id, "store broadcasts closed");
                        events_open = false;
                    }
                },
                message = input.recv() => match message {
                    Some(PageInput::Pointer(event)) => self.handle_pointer(event, now()),
                    Some(PageInput::LoadDocument(document)) => {
                        self.load_document(document);
                        self.reinitialize().await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline(hide_at)), if hide_at.is_some() => {
                    self.tick(now());
                }
                _ = tokio::time::sleep_until(deadline(retry_at)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.reinitialize().await;
                }
            }
        }
        info!(page = %self.id, "page context stopped");
        self
    }

    async fn reinitialize(&mut self) {
        if let Err(err) = self.initialize(now()).await {
            warn!(page = %self.id, error = %err, "page initialization failed");
        }
    }

    fn resolve(&self, node: NodeId) -> Target {
        if let Some(marker) = self.document.closest_with_class(node, MARKER_CLASS) {
            if let Some(word) = self.markers.get(&marker) {
                return Target::Marker(marker, word.clone());
            }
        }
        match self.popup_node {
            Some(popup) if self.document.contains(popup, node) => Target::Popup,
            _ => Target::Outside,
        }
    }

    fn is_close_button(&self, node: NodeId) -> bool {
        self.popup_node.is_some_and(|popup| {
            self.document
                .closest_with_class(node, CLOSE_CLASS)
                .is_some_and(|button| self.document.contains(popup, button))
        })
    }

    fn apply(&mut self, effects: Vec<PopupEffect>) {
        for effect in effects {
            match effect {
                PopupEffect::Unmount { word } => {
                    if let Some(popup) = self.popup_node.take() {
                        self.document.detach(popup);
                    }
                    self.view.hide(&word);
                }
                PopupEffect::Mount { word, anchor } => {
                    self.popup_node = self.mount_popup(&word, anchor);
                    self.view.show(&word, anchor);
                }
            }
        }
    }

    fn mount_popup(&mut self, word: &str, anchor: Position) -> Option<NodeId> {
        let body = self.document.body()?;
        let doc = &mut self.document;
        let popup = doc.append_element(body, "div");
        doc.add_class(popup, POPUP_CLASS);
        doc.set_attribute(popup, WORD_ATTRIBUTE, word);
        doc.set_attribute(
            popup,
            "style",
            &format!("top: {}px; left: {}px;", anchor.y, anchor.x),
        );
        let close = doc.append_element(popup, "button");
        doc.add_class(close, CLOSE_CLASS);
        doc.append_text(close, "\u{00d7}");
        let mount = doc.append_element(popup, "div");
        doc.add_class(mount, MOUNT_CLASS);
        Some(popup)
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn deadline(at: Option<Instant>) -> tokio::time::Instant {
    at.map(tokio::time::Instant::from_std)
        .unwrap_or_else(tokio::time::Instant::now)
}
