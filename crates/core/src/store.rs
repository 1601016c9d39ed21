use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::{Error, Result};

/// Reference to a message previously sent, for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub message_id: i64,
}

/// One album entry. Only the first entry of a group carries a caption.
#[derive(Debug, Clone)]
pub struct AlbumPhoto {
    pub path: PathBuf,
    pub caption: Option<String>,
}

/// Narrow messaging-transport surface the pipeline needs. Any call may
/// come back with `Error::RateLimited` carrying the wait the remote
/// asked for.
pub trait Store: Send + Sync {
    fn provider(&self) -> &'static str;

    fn send_text<'a>(&'a self, chat_id: &'a str, text: &'a str)
    -> BoxFuture<'a, Result<MessageRef>>;

    fn edit_text<'a>(
        &'a self,
        chat_id: &'a str,
        message: MessageRef,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_photo<'a>(
        &'a self,
        chat_id: &'a str,
        path: &'a Path,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_video<'a>(
        &'a self,
        chat_id: &'a str,
        path: &'a Path,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_document<'a>(
        &'a self,
        chat_id: &'a str,
        path: &'a Path,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_media_group<'a>(
        &'a self,
        chat_id: &'a str,
        photos: &'a [AlbumPhoto],
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone)]
pub struct TelegramBotApiStoreConfig {
    pub bot_token: String,
    pub api_base: String,
}

impl TelegramBotApiStoreConfig {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

pub struct TelegramBotApiStore {
    config: TelegramBotApiStoreConfig,
    client: reqwest::Client,
}

impl TelegramBotApiStore {
    pub fn new(config: TelegramBotApiStoreConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base, self.config.bot_token
        )
    }

    async fn file_part(path: &Path) -> Result<reqwest::multipart::Part> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Ok(reqwest::multipart::Part::bytes(bytes).file_name(filename))
    }

    async fn execute(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport {
                message: format!("{method} request failed: {e}"),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| Error::Transport {
            message: format!("{method} read response failed: {e}"),
        })?;

        let parsed: TelegramResponse =
            serde_json::from_str(&body).map_err(|e| Error::Upload {
                message: format!("{method} invalid json: {e}; body={body}"),
            })?;

        if parsed.ok {
            return Ok(parsed.result.unwrap_or(serde_json::Value::Null));
        }

        if let Some(retry_after) = parsed.parameters.and_then(|p| p.retry_after) {
            return Err(Error::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }
        Err(Error::Upload {
            message: parsed
                .description
                .unwrap_or_else(|| format!("{method} http {status}")),
        })
    }

    async fn send_file(
        &self,
        method: &str,
        field: &str,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<()> {
        let part = Self::file_part(path).await?;
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        self.execute(method, form).await?;
        Ok(())
    }
}

impl Store for TelegramBotApiStore {
    fn provider(&self) -> &'static str {
        "telegram.botapi"
    }

    fn send_text<'a>(
        &'a self,
        chat_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageRef>> {
        Box::pin(async move {
            let form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.to_string())
                .text("text", text.to_string());
            let result = self.execute("sendMessage", form).await?;
            let message_id = result
                .get("message_id")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Error::Upload {
                    message: "sendMessage missing result.message_id".to_string(),
                })?;
            Ok(MessageRef { message_id })
        })
    }

    fn edit_text<'a>(
        &'a self,
        chat_id: &'a str,
        message: MessageRef,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.to_string())
                .text("message_id", message.message_id.to_string())
                .text("text", text.to_string());
            self.execute("editMessageText", form).await?;
            Ok(())
        })
    }

    fn send_photo<'a>(
        &'a self,
        chat_id: &'a str,
        path: &'a Path,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_file("sendPhoto", "photo", chat_id, path, caption))
    }

    fn send_video<'a>(
        &'a self,
        chat_id: &'a str,
        path: &'a Path,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_file("sendVideo", "video", chat_id, path, caption))
    }

    fn send_document<'a>(
        &'a self,
        chat_id: &'a str,
        path: &'a Path,
        caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_file("sendDocument", "document", chat_id, path, caption))
    }

    fn send_media_group<'a>(
        &'a self,
        chat_id: &'a str,
        photos: &'a [AlbumPhoto],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut form = reqwest::multipart::Form::new().text("chat_id", chat_id.to_string());
            let mut media = Vec::with_capacity(photos.len());
            for (i, photo) in photos.iter().enumerate() {
                let attach = format!("file{i}");
                let mut item = serde_json::json!({
                    "type": "photo",
                    "media": format!("attach://{attach}"),
                });
                if let Some(caption) = &photo.caption {
                    item["caption"] = serde_json::Value::String(caption.clone());
                }
                media.push(item);
                let part = Self::file_part(&photo.path).await?;
                form = form.part(attach, part);
            }
            let media_json =
                serde_json::to_string(&media).map_err(|e| Error::Upload {
                    message: format!("sendMediaGroup media encode failed: {e}"),
                })?;
            form = form.text("media", media_json);
            self.execute("sendMediaGroup", form).await?;
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    description: Option<String>,
    parameters: Option<TelegramParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramParameters {
    retry_after: Option<u64>,
}

/// Recording fake used by tests and dry runs: every call succeeds and is
/// appended to an ordered event log.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    events: std::sync::Mutex<Vec<StoreEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Text(String),
    EditText(String),
    Photo(PathBuf),
    Video(PathBuf),
    Document(PathBuf),
    MediaGroup(Vec<PathBuf>),
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    fn push(&self, event: StoreEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

impl Store for InMemoryStore {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn send_text<'a>(
        &'a self,
        _chat_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<MessageRef>> {
        Box::pin(async move {
            self.push(StoreEvent::Text(text.to_string()));
            Ok(MessageRef { message_id: 1 })
        })
    }

    fn edit_text<'a>(
        &'a self,
        _chat_id: &'a str,
        _message: MessageRef,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.push(StoreEvent::EditText(text.to_string()));
            Ok(())
        })
    }

    fn send_photo<'a>(
        &'a self,
        _chat_id: &'a str,
        path: &'a Path,
        _caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.push(StoreEvent::Photo(path.to_path_buf()));
            Ok(())
        })
    }

    fn send_video<'a>(
        &'a self,
        _chat_id: &'a str,
        path: &'a Path,
        _caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.push(StoreEvent::Video(path.to_path_buf()));
            Ok(())
        })
    }

    fn send_document<'a>(
        &'a self,
        _chat_id: &'a str,
        path: &'a Path,
        _caption: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.push(StoreEvent::Document(path.to_path_buf()));
            Ok(())
        })
    }

    fn send_media_group<'a>(
        &'a self,
        _chat_id: &'a str,
        photos: &'a [AlbumPhoto],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.push(StoreEvent::MediaGroup(
                photos.iter().map(|p| p.path.clone()).collect(),
            ));
            Ok(())
        })
    }
}
