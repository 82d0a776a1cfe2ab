use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde_json::json;

use crate::error::NotifyError;
use crate::model::PipelineEvent;
use crate::notify::{
    NotifyChannel, Verbosity, format_detailed, format_simple, webhook::classify_status,
};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Chat-bot sink backed by the Telegram bot API.
pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.bot_token, method)
    }
}

impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn format(&self, event: &PipelineEvent, verbosity: Verbosity) -> String {
        match verbosity {
            Verbosity::Simple => format_simple(event),
            Verbosity::Detailed => format_detailed(event),
        }
    }

    fn deliver(&self, payload: &str) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        let text = payload.to_owned();
        Box::pin(async move {
            let body = json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_web_page_preview": true,
            });

            let response = self
                .client
                .post(self.endpoint("sendMessage"))
                .json(&body)
                .send()
                .await
                .change_context(NotifyError::Delivery {
                    channel: "telegram".into(),
                })?;

            classify_status(response.status(), "telegram")
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.client
                .get(self.endpoint("getMe"))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false)
        })
    }
}
