use crate::client::StoreClient;
use crate::config::GlossmarkConfig;
use crate::notify::{ChangeNotifier, FavoritesObserver, PageEvent, PageId};
use crate::record::{DictsData, ImportRecord, WordPatch, WordRecord, same_word};
use crate::store::{StoreEngine, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ActionRequest {
    GetWord {
        word: String,
    },
    DeleteWord {
        word: String,
    },
    GetFavoriteWords,
    GetAllWords,
    ImportWords {
        #[serde(default)]
        data: Vec<Value>,
    },
    GetDictsData,
    SetDictsData {
        data: DictsData,
    },
    UpsertWord {
        data: WordPatch,
    },
}

/// Legacy `{word, statusCheck, statusFav}` message: upsert when either flag
/// is set, delete when both are explicitly cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub word: String,
    #[serde(default, alias = "status_check", skip_serializing_if = "Option::is_none")]
    pub status_check: Option<bool>,
    #[serde(default, alias = "status_fav", skip_serializing_if = "Option::is_none")]
    pub status_fav: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RpcRequest {
    Action(ActionRequest),
    Status(StatusRequest),
}

#[derive(Debug)]
pub struct RequestError(String);

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid request: {}", self.0)
    }
}

impl std::error::Error for RequestError {}

impl RpcRequest {
    /// Decodes a raw message. Anything with an `action` key is an action
    /// request; everything else must be the legacy status shape.
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let has_action = value.get("action").is_some();
        if has_action {
            serde_json::from_value(value)
                .map(RpcRequest::Action)
                .map_err(|err| RequestError(err.to_string()))
        } else {
            serde_json::from_value(value)
                .map(RpcRequest::Status)
                .map_err(|err| RequestError(err.to_string()))
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RpcRequest::Action(action) => match action {
                ActionRequest::GetWord { .. } => "getWord",
                ActionRequest::DeleteWord { .. } => "deleteWord",
                ActionRequest::GetFavoriteWords => "getFavoriteWords",
                ActionRequest::GetAllWords => "getAllWords",
                ActionRequest::ImportWords { .. } => "importWords",
                ActionRequest::GetDictsData => "getDictsData",
                ActionRequest::SetDictsData { .. } => "setDictsData",
                ActionRequest::UpsertWord { .. } => "upsertWord",
            },
            RpcRequest::Status(_) => "status",
        }
    }
}

impl From<ActionRequest> for RpcRequest {
    fn from(value: ActionRequest) -> Self {
        RpcRequest::Action(value)
    }
}

impl From<StatusRequest> for RpcRequest {
    fn from(value: StatusRequest) -> Self {
        RpcRequest::Status(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl RpcResponse {
    pub fn data(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            count: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
            count: None,
        }
    }

    pub fn count(count: usize) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(format!("imported {count} words")),
            count: Some(count),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            count: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl From<StoreError> for RpcResponse {
    fn from(value: StoreError) -> Self {
        RpcResponse::failure(value.to_string())
    }
}

pub struct Envelope {
    pub request: RpcRequest,
    pub reply: oneshot::Sender<RpcResponse>,
}

/// Lazily opened store. The first request that needs the engine opens it; a
/// failed open is reported to that caller and retried by the next one.
#[derive(Clone)]
pub struct StoreHandle {
    cell: Arc<OnceCell<StoreEngine>>,
    data_path: Option<PathBuf>,
    observer: Option<Arc<dyn FavoritesObserver>>,
}

impl StoreHandle {
    pub fn new(data_path: Option<PathBuf>, observer: Option<Arc<dyn FavoritesObserver>>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            data_path,
            observer,
        }
    }

    pub fn ready(engine: StoreEngine) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(engine))),
            data_path: None,
            observer: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn engine(&self) -> Result<&StoreEngine, StoreError> {
        self.cell
            .get_or_try_init(|| async {
                let engine = StoreEngine::open(self.data_path.as_deref())?;
                info!(path = ?engine.path(), words = engine.len(), "word store opened");
                Ok(match &self.observer {
                    Some(observer) => engine.with_observer(observer.clone()),
                    None => engine,
                })
            })
            .await
    }
}

/// Routes requests to the store engine. Cheap to clone; each request is
/// handled on its own task so a slow write never holds up the queue.
#[derive(Clone)]
pub struct Dispatcher {
    store: StoreHandle,
}

impl Dispatcher {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub async fn handle_value(&self, value: Value) -> RpcResponse {
        match RpcRequest::from_value(value) {
            Ok(request) => self.handle(request).await,
            Err(err) => RpcResponse::failure(err.to_string()),
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let label = request.label();
        let engine = match self.store.engine().await {
            Ok(engine) => engine,
            Err(err) => {
                warn!(action = label, error = %err, "store unavailable");
                return err.into();
            }
        };
        let response = match request {
            RpcRequest::Action(action) => handle_action(engine, action),
            RpcRequest::Status(status) => handle_status(engine, status),
        };
        debug!(action = label, success = response.success, "request answered");
        response
    }

    pub async fn serve(self, mut requests: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = requests.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let response = dispatcher.handle(envelope.request).await;
                if envelope.reply.send(response).is_err() {
                    debug!("caller went away before the reply");
                }
            });
        }
        info!("request channel closed; dispatcher stopped");
    }
}

fn handle_action(engine: &StoreEngine, action: ActionRequest) -> RpcResponse {
    match action {
        ActionRequest::GetWord { word } => match engine.get(&word) {
            Some(record) => record_response(&record),
            None => RpcResponse::data(Value::Null),
        },
        ActionRequest::DeleteWord { word } => delete_response(engine, &word),
        ActionRequest::GetFavoriteWords => records_response(&engine.list_favorites()),
        ActionRequest::GetAllWords => records_response(&engine.list_all()),
        ActionRequest::ImportWords { data } => {
            let total = data.len();
            let entries: Vec<ImportRecord> = data
                .into_iter()
                .filter_map(|value| serde_json::from_value(value).ok())
                .collect();
            if entries.len() < total {
                debug!(skipped = total - entries.len(), "ignoring malformed import entries");
            }
            match engine.bulk_import(entries) {
                Ok(count) => RpcResponse::count(count),
                Err(err) => err.into(),
            }
        }
        ActionRequest::GetDictsData => match serde_json::to_value(engine.dicts_data()) {
            Ok(value) => RpcResponse::data(value),
            Err(err) => RpcResponse::failure(err.to_string()),
        },
        ActionRequest::SetDictsData { data } => match engine.set_dicts_data(data) {
            Ok(()) => RpcResponse::message("dicts data saved"),
            Err(err) => err.into(),
        },
        ActionRequest::UpsertWord { data } => match engine.upsert(data) {
            Ok(record) => record_response(&record).with_message("word saved"),
            Err(err) => err.into(),
        },
    }
}

fn handle_status(engine: &StoreEngine, status: StatusRequest) -> RpcResponse {
    let wants_upsert = status.status_check == Some(true) || status.status_fav == Some(true);
    let wants_delete = status.status_check == Some(false) && status.status_fav == Some(false);
    if wants_upsert {
        let mut patch = WordPatch {
            word: status.word,
            status_checked: status.status_check,
            status_favorite: status.status_fav,
            ..WordPatch::default()
        };
        // The bag describes whichever word was looked up last; its details
        // only belong to this record when the words agree.
        let bag = engine.dicts_data();
        if bag
            .dicts_word
            .as_deref()
            .is_some_and(|word| same_word(word, &patch.word))
        {
            patch.meaning = bag.dicts_meaning;
            patch.image = bag.dicts_image;
        }
        match engine.upsert(patch) {
            Ok(record) => RpcResponse::message(format!("saved {:?}", record.word)),
            Err(err) => err.into(),
        }
    } else if wants_delete {
        delete_response(engine, &status.word)
    } else {
        RpcResponse::failure("status request carries no status change")
    }
}

fn delete_response(engine: &StoreEngine, word: &str) -> RpcResponse {
    match engine.delete(word) {
        Ok(Some(record)) => RpcResponse::message(format!("deleted {:?}", record.word)),
        Ok(None) => RpcResponse::message(format!("no record for {word:?}")),
        Err(err) => err.into(),
    }
}

fn record_response(record: &WordRecord) -> RpcResponse {
    match serde_json::to_value(record) {
        Ok(value) => RpcResponse::data(value),
        Err(err) => RpcResponse::failure(err.to_string()),
    }
}

fn records_response(records: &[WordRecord]) -> RpcResponse {
    match serde_json::to_value(records) {
        Ok(value) => RpcResponse::data(value),
        Err(err) => RpcResponse::failure(err.to_string()),
    }
}

pub struct PageChannel {
    pub id: PageId,
    pub client: StoreClient,
    pub events: mpsc::Receiver<PageEvent>,
}

/// The privileged context: owns the dispatcher task and the notifier that
/// pages subscribe to.
pub struct StoreService {
    requests: mpsc::Sender<Envelope>,
    notifier: Arc<ChangeNotifier>,
    event_capacity: usize,
    task: JoinHandle<()>,
}

impl StoreService {
    pub fn spawn(config: &GlossmarkConfig) -> Self {
        let notifier = Arc::new(ChangeNotifier::new());
        let observer: Arc<dyn FavoritesObserver> = notifier.clone();
        let handle = StoreHandle::new(config.data_path.clone(), Some(observer));
        Self::spawn_with(handle, notifier, config)
    }

    pub fn spawn_with(
        handle: StoreHandle,
        notifier: Arc<ChangeNotifier>,
        config: &GlossmarkConfig,
    ) -> Self {
        let (requests, receiver) = mpsc::channel(config.request_capacity.max(1));
        let task = tokio::spawn(Dispatcher::new(handle).serve(receiver));
        info!(path = ?config.data_path, "store service started");
        Self {
            requests,
            notifier,
            event_capacity: config.event_capacity,
            task,
        }
    }

    pub fn client(&self) -> StoreClient {
        StoreClient::new(self.requests.clone())
    }

    pub fn connect_page(&self) -> PageChannel {
        let (id, events) = self.notifier.subscribe(self.event_capacity);
        PageChannel {
            id,
            client: self.client(),
            events,
        }
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn shutdown(self) {
        self.task.abort();
        info!("store service stopped");
    }
}
