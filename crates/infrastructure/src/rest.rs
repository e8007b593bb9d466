//! 消息后端的 HTTP 接口

use std::time::Duration;

use application::{ApiError, ChatApi};
use async_trait::async_trait;
use config::BackendConfig;
use domain::{Conversation, ConversationId, EventId, Identity, Message, MessageContent};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 后端有时把结果包在 `data` 里，有时直接返回
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(value) => value,
        }
    }
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartConversationBody<'a> {
    event_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    participant_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| ApiError::transport(format!("invalid base url {base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::transport(format!(
                "base url cannot carry a path: {base_url}"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn from_config(backend: &BackendConfig, token: Option<String>) -> Result<Self, ApiError> {
        Self::new(&backend.http_base_url, token, backend.request_timeout())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // new() 已经排除了不能作为 base 的地址
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.endpoint(segments);
        debug!(%url, "GET");
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(segments);
        debug!(%url, "POST");
        let response = self
            .authorize(self.client.post(url).json(body))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "后端返回错误状态");
        return Err(ApiError::status(status.as_u16(), message));
    }
    let body = response.bytes().await.map_err(map_reqwest_error)?;
    serde_json::from_slice::<Envelope<T>>(&body)
        .map(Envelope::into_inner)
        .map_err(|err| ApiError::Decode(err.to_string()))
}

fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Transport(err.to_string())
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        self.get(&["api", "conversations"]).await
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        self.get(&["api", "conversations", conversation_id.as_str(), "messages"])
            .await
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &MessageContent,
    ) -> Result<Message, ApiError> {
        self.post(
            &["api", "conversations", conversation_id.as_str(), "messages"],
            &SendMessageBody {
                content: content.as_str(),
            },
        )
        .await
    }

    async fn start_conversation(
        &self,
        event_id: &EventId,
        counterpart: Option<Identity>,
    ) -> Result<Conversation, ApiError> {
        self.post(
            &["api", "conversations"],
            &StartConversationBody {
                event_id: event_id.as_str(),
                participant_id: counterpart.as_ref().map(Identity::as_str),
            },
        )
        .await
    }
}
