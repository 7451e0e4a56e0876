//! 管理员通知
//!
//! 配置了 Telegram 时通过 Bot API 发送，否则只写日志。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::config::{Config, TelegramConfig};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// 发送一条通知，返回错误表示没有送达
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Telegram Bot API `sendMessage`
pub struct TelegramNotifier {
    api_base: String,
    bot_token: String,
    chat_id: i64,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.admin_chat_id,
            client,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| anyhow!("Telegram 请求失败: {}", e))?;

        if resp.status().is_success() {
            debug!("已发送 Telegram 通知");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(anyhow!("Telegram 返回错误: {} - {}", status, body))
        }
    }
}

/// 未配置通知渠道时只写日志
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        warn!("📣 {}", text);
        Ok(())
    }
}

pub fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match &config.telegram {
        Some(tg) if !tg.bot_token.is_empty() => Ok(Arc::new(TelegramNotifier::new(tg)?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}
