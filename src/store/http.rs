use super::MessageStore;
use crate::config::StoreConfig;
use crate::error::{ChatError, ChatResult};
use crate::types::{
    CharacterId, ChatId, Message, MessageId, Page, PageCursor, Reaction, SendReceipt, SendRequest,
    StoreEvent, StoryId,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const UNEXPECTED_ERROR: &str = "Unexpected error occurred";

#[derive(Clone, Copy, Debug)]
enum FunctionKind {
    Query,
    Mutation,
}

impl FunctionKind {
    fn route(self) -> &'static str {
        match self {
            FunctionKind::Query => "api/query",
            FunctionKind::Mutation => "api/mutation",
        }
    }
}

/// Store backed by a Convex-style deployment.
///
/// Reads go through `messages:list`; live updates are produced by polling
/// the newest window of that query and diffing it against the last one.
pub struct HttpStore {
    endpoint: Arc<Endpoint>,
    poll_interval: Duration,
    window: usize,
}

struct Endpoint {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum FunctionResponse {
    Success {
        #[serde(default)]
        value: Value,
    },
    Error {
        #[serde(rename = "errorMessage", default)]
        error_message: Option<String>,
        #[serde(rename = "errorData", default)]
        error_data: Option<Value>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_creationTime")]
    creation_time: f64,
    chat_id: String,
    character_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    translation: Option<String>,
    reaction: Option<Reaction>,
    speech_url: Option<String>,
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        Message {
            id: MessageId(dto.id),
            chat_id: ChatId(dto.chat_id),
            character_id: dto.character_id.map(CharacterId),
            text: dto.text.unwrap_or_default(),
            translation: dto.translation,
            reaction: dto.reaction,
            speech_url: dto.speech_url,
            created_at_us: creation_key(dto.creation_time),
            client_token: None,
        }
    }
}

/// `_creationTime` is fractional milliseconds; rows written by one mutation
/// share the millisecond and differ only below it.
fn creation_key(creation_time_ms: f64) -> u64 {
    (creation_time_ms.max(0.0) * 1_000.0).round() as u64
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaginationResult {
    page: Vec<MessageDto>,
    is_done: bool,
    continue_cursor: Option<String>,
}

impl PaginationResult {
    /// Newest first on the wire; pages are handed out oldest first.
    fn into_page(self) -> Page {
        let mut messages: Vec<Message> = self.page.into_iter().map(Message::from).collect();
        messages.sort_by(|a, b| {
            a.created_at_us
                .cmp(&b.created_at_us)
                .then_with(|| a.id.cmp(&b.id))
        });
        Page {
            messages,
            next_cursor: self.continue_cursor.map(PageCursor),
            has_more: !self.is_done,
        }
    }
}

impl HttpStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            endpoint: Arc::new(Endpoint {
                client: Client::new(),
                base_url: config.base_url.trim_end_matches('/').to_string(),
                auth_token: config.auth_token.clone(),
            }),
            poll_interval: config.poll_interval,
            window: config.subscription_window.max(1),
        }
    }

    async fn mutation(&self, path: &str, args: Value) -> ChatResult<Value> {
        self.endpoint.call(FunctionKind::Mutation, path, args).await
    }
}

impl Endpoint {
    async fn call(&self, kind: FunctionKind, path: &str, args: Value) -> ChatResult<Value> {
        debug!(path, ?kind, "calling backend function");
        let url = format!("{}/{}", self.base_url, kind.route());
        let mut request = self.client.post(url).json(&json!({
            "path": path,
            "args": args,
            "format": "json",
        }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        parse_function_response(status, &body)
    }

    async fn list(
        &self,
        chat_id: &ChatId,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> ChatResult<Page> {
        let value = self
            .call(
                FunctionKind::Query,
                "messages:list",
                json!({
                    "chatId": chat_id.as_str(),
                    "paginationOpts": {
                        "numItems": limit.max(1),
                        "cursor": cursor.map(PageCursor::as_str),
                    },
                }),
            )
            .await?;
        let result: PaginationResult = serde_json::from_value(value)?;
        Ok(result.into_page())
    }
}

/// Map an HTTP response from the function API onto a value or a `ChatError`.
fn parse_function_response(status: StatusCode, body: &str) -> ChatResult<Value> {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(ChatError::unavailable(format!("backend error {status}")));
    }

    match serde_json::from_str::<FunctionResponse>(body) {
        Ok(FunctionResponse::Success { value }) if status.is_success() => Ok(value),
        Ok(FunctionResponse::Success { .. }) => {
            Err(ChatError::rejected(format!("backend error {status}")))
        }
        Ok(FunctionResponse::Error {
            error_message,
            error_data,
        }) => {
            let from_data = error_data.as_ref().and_then(|data| {
                data.get("message")
                    .and_then(Value::as_str)
                    .or_else(|| data.as_str())
                    .map(str::to_string)
            });
            Err(ChatError::rejected(
                from_data
                    .or(error_message)
                    .unwrap_or_else(|| UNEXPECTED_ERROR.to_string()),
            ))
        }
        Err(_) if status.is_success() => Err(ChatError::unavailable(format!(
            "malformed response: {body}"
        ))),
        Err(_) => Err(ChatError::rejected(if body.trim().is_empty() {
            UNEXPECTED_ERROR.to_string()
        } else {
            body.trim().to_string()
        })),
    }
}

/// Events that turn the `previous` window into `current`.
///
/// Ids that vanished are only reported as removed while they are still
/// inside the window; older ones simply scrolled out of it.
fn diff_window(previous: &HashMap<MessageId, Message>, current: &[Message]) -> Vec<StoreEvent> {
    let mut events: Vec<StoreEvent> = Vec::new();

    let oldest_visible = current.iter().map(|m| m.created_at_us).min();
    let mut vanished: Vec<&Message> = previous
        .values()
        .filter(|old| !current.iter().any(|m| m.id == old.id))
        .filter(|old| oldest_visible.is_none_or(|oldest| old.created_at_us >= oldest))
        .collect();
    vanished.sort_by_key(|m| m.created_at_us);
    events.extend(
        vanished
            .into_iter()
            .map(|m| StoreEvent::Removed(m.id.clone())),
    );

    events.extend(
        current
            .iter()
            .filter(|m| previous.get(&m.id) != Some(*m))
            .cloned()
            .map(StoreEvent::Upsert),
    );
    events
}

struct PollState {
    endpoint: Arc<Endpoint>,
    chat_id: ChatId,
    window: usize,
    interval: Duration,
    seen: HashMap<MessageId, Message>,
    queued: VecDeque<StoreEvent>,
    primed: bool,
}

impl PollState {
    async fn poll(&mut self) {
        if self.primed {
            tokio::time::sleep(self.interval).await;
        }
        self.primed = true;

        match self.endpoint.list(&self.chat_id, None, self.window).await {
            Ok(page) => {
                self.queued.extend(diff_window(&self.seen, &page.messages));
                self.seen = page
                    .messages
                    .into_iter()
                    .map(|m| (m.id.clone(), m))
                    .collect();
            }
            Err(err) => {
                warn!(chat_id = %self.chat_id, error = %err, "message poll failed");
            }
        }
    }
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn load_older_page(
        &self,
        chat_id: &ChatId,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> ChatResult<Page> {
        self.endpoint.list(chat_id, cursor, limit).await
    }

    fn subscribe_new(&self, chat_id: &ChatId) -> BoxStream<'static, StoreEvent> {
        let state = PollState {
            endpoint: Arc::clone(&self.endpoint),
            chat_id: chat_id.clone(),
            window: self.window,
            interval: self.poll_interval,
            seen: HashMap::new(),
            queued: VecDeque::new(),
            primed: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queued.pop_front() {
                    return Some((event, state));
                }
                state.poll().await;
            }
        })
        .boxed()
    }

    async fn send_message(&self, request: SendRequest) -> ChatResult<SendReceipt> {
        let value = self
            .mutation(
                "messages:send",
                json!({
                    "message": request.text,
                    "chatId": request.chat_id.as_str(),
                    "characterId": request.character_id.as_str(),
                }),
            )
            .await?;
        Ok(SendReceipt {
            message_id: value.as_str().map(MessageId::from),
        })
    }

    async fn react(&self, message_id: &MessageId, reaction: Reaction) -> ChatResult<()> {
        self.mutation(
            "messages:react",
            json!({ "messageId": message_id.as_str(), "type": reaction.as_str() }),
        )
        .await?;
        Ok(())
    }

    async fn regenerate(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        character_id: &CharacterId,
    ) -> ChatResult<()> {
        self.mutation(
            "messages:regenerate",
            json!({
                "messageId": message_id.as_str(),
                "chatId": chat_id.as_str(),
                "characterId": character_id.as_str(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn translate(&self, message_id: &MessageId, target_language: &str) -> ChatResult<()> {
        self.mutation(
            "messages:translate",
            json!({ "messageId": message_id.as_str(), "targetLanguage": target_language }),
        )
        .await?;
        Ok(())
    }

    async fn request_speech(
        &self,
        message_id: &MessageId,
        character_id: &CharacterId,
        text: &str,
    ) -> ChatResult<Option<String>> {
        let value = self
            .mutation(
                "speeches:generate",
                json!({
                    "messageId": message_id.as_str(),
                    "characterId": character_id.as_str(),
                    "text": text,
                }),
            )
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn create_story(
        &self,
        character_id: &CharacterId,
        message_ids: &[MessageId],
    ) -> ChatResult<StoryId> {
        let ids: Vec<&str> = message_ids.iter().map(MessageId::as_str).collect();
        let value = self
            .mutation(
                "stories:create",
                json!({ "characterId": character_id.as_str(), "messageIds": ids }),
            )
            .await?;
        value
            .as_str()
            .map(StoryId::from)
            .ok_or_else(|| ChatError::unavailable("stories:create returned no story id"))
    }

    async fn remove_chat(&self, chat_id: &ChatId) -> ChatResult<()> {
        self.mutation("chats:remove", json!({ "id": chat_id.as_str() }))
            .await?;
        Ok(())
    }

    async fn autopilot(&self, chat_id: &ChatId, character_id: &CharacterId) -> ChatResult<()> {
        self.mutation(
            "followUps:autopilot",
            json!({ "chatId": chat_id.as_str(), "characterId": character_id.as_str() }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, at: u64, text: &str) -> Message {
        Message {
            id: MessageId::from(id),
            chat_id: ChatId::from("chat"),
            character_id: None,
            text: text.to_string(),
            translation: None,
            reaction: None,
            speech_url: None,
            created_at_us: at,
            client_token: None,
        }
    }

    fn seen(messages: &[Message]) -> HashMap<MessageId, Message> {
        messages.iter().map(|m| (m.id.clone(), m.clone())).collect()
    }

    #[test]
    fn success_value_is_returned() {
        let value = parse_function_response(
            StatusCode::OK,
            r#"{"status":"success","value":"k57abc"}"#,
        )
        .unwrap();
        assert_eq!(value, json!("k57abc"));
    }

    #[test]
    fn convex_error_data_message_wins() {
        let err = parse_function_response(
            StatusCode::OK,
            r#"{"status":"error","errorMessage":"Uncaught ConvexError","errorData":{"message":"Not enough crystals."}}"#,
        )
        .unwrap_err();
        assert_eq!(err, ChatError::rejected("Not enough crystals."));
    }

    #[test]
    fn error_without_message_falls_back() {
        let err = parse_function_response(StatusCode::BAD_REQUEST, r#"{"status":"error"}"#)
            .unwrap_err();
        assert_eq!(err, ChatError::rejected(UNEXPECTED_ERROR));
    }

    #[test]
    fn server_failures_are_transient() {
        for status in [
            StatusCode::BAD_GATEWAY,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(parse_function_response(status, "").unwrap_err().is_transient());
        }
    }

    #[test]
    fn page_parses_and_sorts_ascending() {
        let raw = json!({
            "page": [
                {"_id": "b", "_creationTime": 20.0, "chatId": "chat", "characterId": "c1", "text": "second"},
                {"_id": "a", "_creationTime": 10.0, "chatId": "chat", "text": "first", "reaction": "like"},
            ],
            "isDone": false,
            "continueCursor": "cursor-1",
        });
        let page = serde_json::from_value::<PaginationResult>(raw)
            .unwrap()
            .into_page();
        let messages = &page.messages;
        assert_eq!(messages[0].id.as_str(), "a");
        assert_eq!(messages[0].reaction, Some(Reaction::Like));
        assert!(messages[0].character_id.is_none());
        assert_eq!(messages[1].character_id, Some(CharacterId::from("c1")));
        assert_eq!(page.next_cursor, Some(PageCursor::from("cursor-1")));
        assert!(page.has_more);
    }

    #[test]
    fn same_millisecond_rows_keep_creation_order() {
        let raw = json!({
            "page": [
                {"_id": "a_reply", "_creationTime": 1000.7, "chatId": "chat", "characterId": "c1", "text": ""},
                {"_id": "z_user", "_creationTime": 1000.3, "chatId": "chat", "text": "hi"},
            ],
            "isDone": true,
            "continueCursor": null,
        });
        let page = serde_json::from_value::<PaginationResult>(raw)
            .unwrap()
            .into_page();
        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["z_user", "a_reply"]);
        assert_eq!(page.messages[0].created_at_us, 1_000_300);
        assert!(!page.has_more);
    }

    #[test]
    fn diff_reports_new_and_changed_messages() {
        let before = vec![message("a", 1, "one"), message("b", 2, "")];
        let after = vec![
            message("a", 1, "one"),
            message("b", 2, "done"),
            message("c", 3, "three"),
        ];
        let events = diff_window(&seen(&before), &after);
        assert_eq!(
            events,
            vec![
                StoreEvent::Upsert(message("b", 2, "done")),
                StoreEvent::Upsert(message("c", 3, "three")),
            ]
        );
    }

    #[test]
    fn diff_ignores_messages_scrolled_out_of_window() {
        let before = vec![message("a", 1, "one"), message("b", 2, "two")];
        let after = vec![message("b", 2, "two"), message("c", 3, "three")];
        let events = diff_window(&seen(&before), &after);
        assert_eq!(events, vec![StoreEvent::Upsert(message("c", 3, "three"))]);
    }

    #[test]
    fn diff_reports_removals_inside_window() {
        let before = vec![
            message("a", 1, "one"),
            message("b", 2, "two"),
            message("c", 3, "three"),
        ];
        let after = vec![message("a", 1, "one"), message("c", 3, "three")];
        let events = diff_window(&seen(&before), &after);
        assert_eq!(events, vec![StoreEvent::Removed(MessageId::from("b"))]);
    }
}
