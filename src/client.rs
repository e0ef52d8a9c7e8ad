use crate::record::{DictsData, WordPatch, WordRecord, same_word};
use crate::rpc::{ActionRequest, Envelope, RpcRequest, RpcResponse, StatusRequest};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug)]
pub enum ClientError {
    /// The store context is gone or dropped the request.
    Disconnected,
    /// The store answered with `success: false`.
    Rejected(String),
    Decode(serde_json::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Disconnected => write!(f, "store context is not reachable"),
            ClientError::Rejected(message) => write!(f, "store rejected request: {message}"),
            ClientError::Decode(err) => write!(f, "unexpected response payload: {err}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Decode(value)
    }
}

/// Page-side handle for talking to the store context.
#[derive(Clone)]
pub struct StoreClient {
    requests: mpsc::Sender<Envelope>,
}

impl StoreClient {
    pub fn new(requests: mpsc::Sender<Envelope>) -> Self {
        Self { requests }
    }

    /// Sends a request and waits for whatever the store answers.
    pub async fn send(&self, request: impl Into<RpcRequest>) -> Result<RpcResponse, ClientError> {
        let request = request.into();
        let label = request.label();
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Envelope { request, reply })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        let response = receiver.await.map_err(|_| ClientError::Disconnected)?;
        debug!(action = label, success = response.success, "store replied");
        Ok(response)
    }

    async fn call(&self, request: impl Into<RpcRequest>) -> Result<RpcResponse, ClientError> {
        let response = self.send(request).await?;
        if response.success {
            Ok(response)
        } else {
            Err(ClientError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }

    async fn call_data<T: DeserializeOwned>(
        &self,
        request: impl Into<RpcRequest>,
    ) -> Result<T, ClientError> {
        let response = self.call(request).await?;
        Ok(serde_json::from_value(response.data.unwrap_or(Value::Null))?)
    }

    pub async fn get_word(&self, word: &str) -> Result<Option<WordRecord>, ClientError> {
        self.call_data(ActionRequest::GetWord {
            word: word.to_string(),
        })
        .await
    }

    pub async fn get_favorite_words(&self) -> Result<Vec<WordRecord>, ClientError> {
        self.call_data(ActionRequest::GetFavoriteWords).await
    }

    pub async fn get_all_words(&self) -> Result<Vec<WordRecord>, ClientError> {
        self.call_data(ActionRequest::GetAllWords).await
    }

    pub async fn delete_word(&self, word: &str) -> Result<String, ClientError> {
        let response = self
            .call(ActionRequest::DeleteWord {
                word: word.to_string(),
            })
            .await?;
        Ok(response.message.unwrap_or_default())
    }

    pub async fn import_words(&self, records: Vec<Value>) -> Result<usize, ClientError> {
        let response = self.call(ActionRequest::ImportWords { data: records }).await?;
        Ok(response.count.unwrap_or(0))
    }

    pub async fn upsert_word(&self, patch: WordPatch) -> Result<WordRecord, ClientError> {
        self.call_data(ActionRequest::UpsertWord { data: patch }).await
    }

    pub async fn get_dicts_data(&self) -> Result<DictsData, ClientError> {
        self.call_data(ActionRequest::GetDictsData).await
    }

    pub async fn set_dicts_data(&self, data: DictsData) -> Result<String, ClientError> {
        let response = self.call(ActionRequest::SetDictsData { data }).await?;
        Ok(response.message.unwrap_or_default())
    }

    /// Records a status change for `word` and sends the legacy status
    /// message, which upserts or deletes the stored record. The field bag is
    /// refreshed (counter and timestamps) only when it is empty or already
    /// describes `word`; a bag left over from another word is not touched, so
    /// its meaning is never copied onto `word`.
    pub async fn update_word_status(
        &self,
        word: &str,
        status_check: bool,
        status_fav: bool,
    ) -> Result<String, ClientError> {
        let current = self.get_dicts_data().await?;
        let owns_bag = current
            .dicts_word
            .as_deref()
            .is_none_or(|owner| same_word(owner, word));
        if owns_bag {
            let now = Utc::now().to_rfc3339();
            self.set_dicts_data(DictsData {
                dicts_word: Some(word.to_string()),
                dicts_status_check: Some(status_check),
                dicts_status_fav: Some(status_fav),
                dicts_count: Some(current.dicts_count.unwrap_or(0).saturating_add(1)),
                dicts_update_time: Some(now.clone()),
                dicts_create_time: Some(current.dicts_create_time.unwrap_or(now)),
                ..DictsData::default()
            })
            .await?;
        } else {
            debug!(word, "field bag belongs to another word; left unchanged");
        }
        let response = self
            .call(StatusRequest {
                word: word.to_string(),
                status_check: Some(status_check),
                status_fav: Some(status_fav),
            })
            .await?;
        Ok(response.message.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlossmarkConfig;
    use crate::rpc::StoreService;
    use serde_json::json;

    #[tokio::test]
    async fn typed_calls_round_trip_through_service() {
        let service = StoreService::spawn(&GlossmarkConfig::default());
        let client = service.client();

        assert_eq!(client.get_word("apple").await.unwrap(), None);
        client
            .upsert_word(WordPatch::new("Apple").meaning("fruit").favorite(true))
            .await
            .unwrap();
        let record = client.get_word("apple").await.unwrap().unwrap();
        assert_eq!(record.word, "Apple");
        assert_eq!(client.get_favorite_words().await.unwrap().len(), 1);

        let count = client
            .import_words(vec![json!({ "word": "Cat", "meaning": "feline" })])
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(client.get_all_words().await.unwrap().len(), 2);

        let message = client.delete_word("Apple").await.unwrap();
        assert!(message.contains("Apple"));
        assert!(client.get_favorite_words().await.unwrap().is_empty());
        service.shutdown();
    }

    #[tokio::test]
    async fn update_word_status_bumps_bag_and_saves_record() {
        let service = StoreService::spawn(&GlossmarkConfig::default());
        let client = service.client();
        client
            .set_dicts_data(DictsData {
                dicts_meaning: Some("a small bird".into()),
                ..DictsData::default()
            })
            .await
            .unwrap();

        client.update_word_status("wren", true, true).await.unwrap();
        client.update_word_status("wren", true, true).await.unwrap();

        let bag = client.get_dicts_data().await.unwrap();
        assert_eq!(bag.dicts_word.as_deref(), Some("wren"));
        assert_eq!(bag.dicts_count, Some(2));
        assert!(bag.dicts_create_time.is_some());

        let record = client.get_word("wren").await.unwrap().unwrap();
        assert_eq!(record.meaning.as_deref(), Some("a small bird"));
        assert_eq!(record.occurrence_count, 2);
        assert!(record.status_favorite);

        client.update_word_status("wren", false, false).await.unwrap();
        assert!(client.get_word("wren").await.unwrap().is_none());
        service.shutdown();
    }

    #[tokio::test]
    async fn update_word_status_leaves_foreign_bag_alone() {
        let service = StoreService::spawn(&GlossmarkConfig::default());
        let client = service.client();
        client
            .set_dicts_data(DictsData {
                dicts_word: Some("apple".into()),
                dicts_meaning: Some("a red fruit".into()),
                dicts_count: Some(3),
                ..DictsData::default()
            })
            .await
            .unwrap();

        client.update_word_status("cat", true, true).await.unwrap();

        let record = client.get_word("cat").await.unwrap().unwrap();
        assert_eq!(record.meaning, None);
        assert!(record.status_favorite);
        let bag = client.get_dicts_data().await.unwrap();
        assert_eq!(bag.dicts_word.as_deref(), Some("apple"));
        assert_eq!(bag.dicts_count, Some(3));
        service.shutdown();
    }

    #[tokio::test]
    async fn rejected_and_disconnected_errors() {
        let service = StoreService::spawn(&GlossmarkConfig::default());
        let client = service.client();
        let err = client
            .upsert_word(WordPatch::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));

        service.shutdown();
        tokio::task::yield_now().await;
        let err = client.get_all_words().await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
    }
}
