//! # Telegram Channel Publishing
//!
//! This module posts selected deals to a Telegram channel through the Bot API.
//! Each deal becomes one message: a photo with an HTML caption when the deal
//! has an image, otherwise (or when the photo post fails) a text message with
//! the same content.
//!
//! ## Features
//!
//! - **Photo First**: `sendPhoto` with caption and a "Buy now" inline button
//! - **Text Fallback**: `sendMessage` carrying the same caption and button
//! - **Bounded Retries**: throttling, server errors and network failures are
//!   retried a fixed number of times with a fixed pause
//! - **Terminal Rejections**: any other 4xx is final for that send
//!
//! ## Bot API Endpoints
//!
//! - `POST {api_base}/bot{token}/sendPhoto`
//! - `POST {api_base}/bot{token}/sendMessage`
//!
//! Both take a JSON body and use `parse_mode = "HTML"`.
//!
//! ## Environment Configuration
//!
//! `TELEGRAM_BOT_TOKEN` is required to build a [`TelegramChannel`].
//! `TELEGRAM_CHANNEL_ID` names the target chat (default `@SEMMAOFFERS`).

pub mod message;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::models::{Candidate, InlineKeyboardMarkup, SendMessage, SendPhoto};

const PARSE_MODE: &str = "HTML";

/// Result of one send attempt against the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The API accepted the message.
    Delivered,
    /// Worth retrying: throttled, server-side failure or network error.
    Transient(String),
    /// The API refused the message; retrying the same payload won't help.
    Rejected(String),
}

/// Destination for rendered posts.
///
/// Implemented by [`TelegramChannel`] in production and by recording fakes in
/// tests. Implementations make exactly one request per call; retrying is the
/// [`Dispatcher`]'s job.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send_photo(&self, payload: &SendPhoto) -> Delivery;
    async fn send_text(&self, payload: &SendMessage) -> Delivery;
}

/// Telegram Bot API client.
///
/// ## Fields
///
/// - `client`: shared reqwest client; connection pooling is handled internally
/// - `api_base`: API root without trailing slash, overridable for testing
/// - `token`: bot token, only ever placed in the request path
#[derive(Clone)]
pub struct TelegramChannel {
    client: Client,
    api_base: String,
    token: String,
}

impl TelegramChannel {
    /// Builds a channel client from settings.
    ///
    /// ## Errors
    ///
    /// Fails when `TELEGRAM_BOT_TOKEN` is not configured or the HTTP client
    /// cannot be constructed.
    pub fn new(settings: &Settings) -> Result<Self> {
        let token = settings.bot_token()?.to_string();
        let client = Client::builder().timeout(settings.request_timeout).build()?;

        Ok(Self {
            client,
            api_base: settings.telegram_api_base.clone(),
            token,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Posts `payload` to a Bot API method and classifies the outcome.
    ///
    /// Network error messages are stripped of the request URL so the token
    /// never reaches the logs.
    async fn call<T: Serialize + Sync>(&self, method: &str, payload: &T) -> Delivery {
        let response = match self
            .client
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Delivery::Transient(err.without_url().to_string()),
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    async fn send_photo(&self, payload: &SendPhoto) -> Delivery {
        self.call("sendPhoto", payload).await
    }

    async fn send_text(&self, payload: &SendMessage) -> Delivery {
        self.call("sendMessage", payload).await
    }
}

/// Maps a Bot API status to a [`Delivery`].
///
/// - **2xx**: delivered
/// - **429 and 5xx**: transient
/// - **anything else**: rejected, using the API's `description` when present
pub fn classify_response(status: u16, body: &str) -> Delivery {
    if (200..300).contains(&status) {
        return Delivery::Delivered;
    }

    let description = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("description")?.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == 429 || (500..600).contains(&status) {
        Delivery::Transient(description)
    } else {
        Delivery::Rejected(description)
    }
}

#[derive(Clone, Copy)]
enum Payload<'a> {
    Photo(&'a SendPhoto),
    Text(&'a SendMessage),
}

/// Turns candidates into channel posts.
///
/// The dispatcher owns rendering and retry policy; the [`Channel`] only moves
/// bytes. It is `Clone` and cheap to share: the channel sits behind an `Arc`.
///
/// ## Delivery Rules
///
/// 1. With an image URL, try `sendPhoto` up to `attempts` times while the
///    outcome is transient.
/// 2. If the photo was not delivered (or there is no image), try `sendMessage`
///    under the same rules.
/// 3. A rejection ends the current send immediately.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    settings: Arc<Settings>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn Channel>, settings: Arc<Settings>) -> Self {
        Self { channel, settings }
    }

    /// Publishes one deal. Returns `true` once either the photo or the text
    /// post was delivered.
    pub async fn dispatch(&self, candidate: &Candidate) -> bool {
        let link = self.settings.affiliate_link(&candidate.source_url());
        let emoji = self.settings.emoji_for(&candidate.category);
        let keyboard = InlineKeyboardMarkup::single("🛒 Buy now", &link);

        if let Some(photo) = &candidate.image_url {
            let payload = SendPhoto {
                chat_id: self.settings.telegram_channel_id.clone(),
                photo: photo.clone(),
                caption: message::render_caption(candidate, &link, emoji),
                parse_mode: PARSE_MODE,
                reply_markup: Some(keyboard.clone()),
            };

            match self.send_with_retry(Payload::Photo(&payload)).await {
                Delivery::Delivered => {
                    info!("Posted {} with photo", candidate.id);
                    return true;
                }
                other => {
                    warn!(
                        "Photo post for {} failed ({:?}); falling back to text",
                        candidate.id, other
                    );
                }
            }
        }

        let payload = SendMessage {
            chat_id: self.settings.telegram_channel_id.clone(),
            text: message::render_text(candidate, &link, emoji),
            parse_mode: PARSE_MODE,
            disable_web_page_preview: false,
            reply_markup: Some(keyboard),
        };

        match self.send_with_retry(Payload::Text(&payload)).await {
            Delivery::Delivered => {
                info!("Posted {} as text", candidate.id);
                true
            }
            other => {
                error!("Could not post {}: {:?}", candidate.id, other);
                false
            }
        }
    }

    /// Publishes a value-add tip as plain text.
    pub async fn post_tip(&self, tip: &str) -> bool {
        let payload = SendMessage {
            chat_id: self.settings.telegram_channel_id.clone(),
            text: message::render_tip(tip),
            parse_mode: PARSE_MODE,
            disable_web_page_preview: true,
            reply_markup: None,
        };

        match self.send_with_retry(Payload::Text(&payload)).await {
            Delivery::Delivered => true,
            other => {
                warn!("Could not post tip: {:?}", other);
                false
            }
        }
    }

    async fn send_with_retry(&self, payload: Payload<'_>) -> Delivery {
        let attempts = self.settings.dispatch_attempts.max(1);

        for attempt in 1..=attempts {
            let delivery = match payload {
                Payload::Photo(photo) => self.channel.send_photo(photo).await,
                Payload::Text(text) => self.channel.send_text(text).await,
            };

            match delivery {
                Delivery::Transient(reason) if attempt < attempts => {
                    warn!(
                        "Transient send failure: {} (attempt {}/{})",
                        reason, attempt, attempts
                    );
                    tokio::time::sleep(self.settings.dispatch_retry_delay).await;
                }
                other => return other,
            }
        }

        Delivery::Transient("retry budget exhausted".to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::ItemId;
    use std::collections::VecDeque;
    use std::time::Duration;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Sent {
        Photo { photo: String, caption: String },
        Text { text: String },
    }

    /// Records every request and answers from a script, defaulting to delivered.
    #[derive(Default)]
    pub(crate) struct FakeChannel {
        script: Mutex<VecDeque<Delivery>>,
        pub(crate) sent: Mutex<Vec<Sent>>,
    }

    impl FakeChannel {
        pub(crate) fn scripted(script: Vec<Delivery>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn next(&self) -> Delivery {
            self.script.lock().unwrap().pop_front().unwrap_or(Delivery::Delivered)
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn send_photo(&self, payload: &SendPhoto) -> Delivery {
            self.sent.lock().unwrap().push(Sent::Photo {
                photo: payload.photo.clone(),
                caption: payload.caption.clone(),
            });
            self.next()
        }

        async fn send_text(&self, payload: &SendMessage) -> Delivery {
            self.sent.lock().unwrap().push(Sent::Text {
                text: payload.text.clone(),
            });
            self.next()
        }
    }

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            dispatch_attempts: 3,
            dispatch_retry_delay: Duration::ZERO,
            ..Settings::default()
        })
    }

    fn deal(image: Option<&str>) -> Candidate {
        let mut c = Candidate::new(ItemId::parse("B0ABCDEF12").unwrap(), "Trail Shoes", "Sports, Fitness & Outdoors").unwrap();
        c.set_prices(Some(1500.0), Some(5000.0));
        c.image_url = image.map(str::to_string);
        c
    }

    #[tokio::test]
    async fn photo_post_when_image_present() {
        let channel = FakeChannel::scripted(vec![]);
        let dispatcher = Dispatcher::new(channel.clone(), settings());

        assert!(dispatcher.dispatch(&deal(Some("https://img.test/shoe.jpg"))).await);

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        let Sent::Photo { photo, caption } = &sent[0] else {
            panic!("expected photo, got {:?}", sent[0]);
        };
        assert_eq!(photo, "https://img.test/shoe.jpg");
        assert!(caption.contains("70% OFF"));
        assert!(caption.contains("tag=semmaoffers-21"));
        assert!(caption.starts_with("🏋️"));
    }

    #[tokio::test]
    async fn text_post_without_image() {
        let channel = FakeChannel::scripted(vec![]);
        let dispatcher = Dispatcher::new(channel.clone(), settings());

        assert!(dispatcher.dispatch(&deal(None)).await);
        assert!(matches!(channel.sent().as_slice(), [Sent::Text { .. }]));
    }

    #[tokio::test]
    async fn rejected_photo_falls_back_to_text() {
        let channel = FakeChannel::scripted(vec![Delivery::Rejected(
            "Bad Request: wrong file identifier".to_string(),
        )]);
        let dispatcher = Dispatcher::new(channel.clone(), settings());

        assert!(dispatcher.dispatch(&deal(Some("https://img.test/broken.jpg"))).await);

        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Sent::Photo { .. }));
        assert!(matches!(sent[1], Sent::Text { .. }));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let channel = FakeChannel::scripted(vec![
            Delivery::Transient("Too Many Requests".to_string()),
            Delivery::Transient("Bad Gateway".to_string()),
        ]);
        let dispatcher = Dispatcher::new(channel.clone(), settings());

        assert!(dispatcher.dispatch(&deal(Some("https://img.test/shoe.jpg"))).await);

        let sent = channel.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| matches!(s, Sent::Photo { .. })));
    }

    #[tokio::test]
    async fn gives_up_after_both_paths_fail() {
        let channel = FakeChannel::scripted(vec![
            Delivery::Transient("Internal Server Error".to_string()),
            Delivery::Transient("Internal Server Error".to_string()),
            Delivery::Transient("Internal Server Error".to_string()),
            Delivery::Rejected("Forbidden: bot is not a member".to_string()),
        ]);
        let dispatcher = Dispatcher::new(channel.clone(), settings());

        assert!(!dispatcher.dispatch(&deal(Some("https://img.test/shoe.jpg"))).await);
        assert_eq!(channel.sent().len(), 4);
    }

    #[tokio::test]
    async fn tips_are_plain_text() {
        let channel = FakeChannel::scripted(vec![]);
        let dispatcher = Dispatcher::new(channel.clone(), settings());

        assert!(dispatcher.post_tip("Stack coupons & cashback").await);
        assert_eq!(
            channel.sent(),
            vec![Sent::Text {
                text: "💡 Stack coupons &amp; cashback".to_string()
            }]
        );
    }

    #[test]
    fn classifies_bot_api_statuses() {
        assert_eq!(classify_response(200, "{\"ok\":true}"), Delivery::Delivered);
        assert_eq!(
            classify_response(429, "{\"ok\":false,\"description\":\"Too Many Requests: retry after 5\"}"),
            Delivery::Transient("Too Many Requests: retry after 5".to_string())
        );
        assert_eq!(classify_response(502, "<html>"), Delivery::Transient("HTTP 502".to_string()));
        assert_eq!(
            classify_response(400, "{\"ok\":false,\"description\":\"Bad Request: chat not found\"}"),
            Delivery::Rejected("Bad Request: chat not found".to_string())
        );
        assert!(matches!(classify_response(403, ""), Delivery::Rejected(_)));
    }

    #[test]
    fn channel_requires_token() {
        assert!(TelegramChannel::new(&Settings::default()).is_err());

        let settings = Settings {
            telegram_bot_token: Some("123:abc".to_string()),
            ..Settings::default()
        };
        let channel = TelegramChannel::new(&settings).unwrap();
        assert_eq!(
            channel.method_url("sendPhoto"),
            "https://api.telegram.org/bot123:abc/sendPhoto"
        );
    }
}
