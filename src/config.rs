//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::crypto::{ENCODING_KEY_LEN, WechatCrypto};
use crate::error::{EnvelopeError, EnvelopeResult};

/// Official Account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "weixin")]
pub struct WeixinConfig {
    // =========================================================================
    // Platform credentials
    // =========================================================================
    /// API host name
    #[serde(rename = "Host", default = "default_host")]
    pub host: String,

    /// AppID, also the tenant id embedded in every encrypted frame
    #[serde(rename = "AppID")]
    pub app_id: String,

    /// AppSecret (for access token requests)
    #[serde(rename = "AppSecret", default)]
    pub app_secret: Option<String>,

    /// Token for signature verification
    #[serde(rename = "Token")]
    pub token: String,

    /// EncodingAESKey (43 characters, absent for plain mode)
    #[serde(rename = "EncodingAESKey", default)]
    pub encoding_aes_key: Option<String>,

    /// Previous EncodingAESKey, still accepted while the platform rotates
    #[serde(rename = "OldEncodingAESKey", default)]
    pub old_encoding_aes_key: Option<String>,

    // =========================================================================
    // Server
    // =========================================================================
    /// Webhook server bind address
    #[serde(rename = "WebhookAddr", default = "default_webhook_addr")]
    pub webhook_addr: String,

    /// Callback path configured on the platform
    #[serde(rename = "WebhookPath", default = "default_webhook_path")]
    pub webhook_path: String,

    /// Enable debug mode (log raw messages)
    #[serde(rename = "DebugMode", default)]
    pub debug_mode: bool,
}

fn default_host() -> String {
    "api.weixin.qq.com".to_string()
}

fn default_webhook_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_webhook_path() -> String {
    "/weixin".to_string()
}

impl WeixinConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup("WEIXIN_TOKEN").context("WEIXIN_TOKEN is required")?;
        let app_id = lookup("WEIXIN_APP_ID").context("WEIXIN_APP_ID is required")?;

        let config = Self {
            host: lookup("WEIXIN_HOST").unwrap_or_else(default_host),
            app_id,
            app_secret: lookup("WEIXIN_APP_SECRET"),
            token,
            encoding_aes_key: lookup("WEIXIN_ENCODING_AES_KEY"),
            old_encoding_aes_key: lookup("WEIXIN_OLD_ENCODING_AES_KEY"),
            webhook_addr: lookup("WEBHOOK_ADDR").unwrap_or_else(default_webhook_addr),
            webhook_path: lookup("WEBHOOK_PATH").unwrap_or_else(default_webhook_path),
            debug_mode: lookup("DEBUG_MODE").is_some(),
        }
        .normalized();

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an XML file with a `<weixin>` root
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = serde_xml_rs::from_str(&xml)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        let config = config.normalized();

        config.validate()?;
        Ok(config)
    }

    /// Write a config template to be filled in with the platform's values
    pub fn write_template(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let template = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<weixin>
  <Host>{}</Host>
  <AppID>appid</AppID>
  <AppSecret>appsecret</AppSecret>
  <Token>token</Token>
  <EncodingAESKey>-</EncodingAESKey>
  <WebhookAddr>{}</WebhookAddr>
  <WebhookPath>{}</WebhookPath>
</weixin>
"#,
            default_host(),
            default_webhook_addr(),
            default_webhook_path()
        );

        std::fs::write(path, template)
            .with_context(|| format!("Failed to write config template: {:?}", path))
    }

    /// Check credentials before anything is served
    pub fn validate(&self) -> EnvelopeResult<()> {
        if self.token.trim().is_empty() {
            return Err(EnvelopeError::Config("token must not be empty".to_string()));
        }
        if self.app_id.trim().is_empty() {
            return Err(EnvelopeError::Config("app id must not be empty".to_string()));
        }
        if self.encoding_aes_key.is_none() && self.old_encoding_aes_key.is_some() {
            return Err(EnvelopeError::Config(
                "old EncodingAESKey set without a current one".to_string(),
            ));
        }
        for key in [&self.encoding_aes_key, &self.old_encoding_aes_key]
            .into_iter()
            .flatten()
        {
            let chars = key.chars().count();
            if chars != ENCODING_KEY_LEN {
                return Err(EnvelopeError::Config(format!(
                    "EncodingAESKey must be {} characters, got {}",
                    ENCODING_KEY_LEN, chars
                )));
            }
        }
        if !self.webhook_path.starts_with('/') {
            return Err(EnvelopeError::Config(format!(
                "webhook path must start with '/': {}",
                self.webhook_path
            )));
        }
        Ok(())
    }

    /// Build the message codec, `None` in plain mode
    pub fn crypto(&self) -> EnvelopeResult<Option<WechatCrypto>> {
        let Some(key) = &self.encoding_aes_key else {
            return Ok(None);
        };

        let mut crypto = WechatCrypto::new(key, &self.app_id)?;
        if let Some(old_key) = &self.old_encoding_aes_key {
            crypto = crypto.with_rotated_key(old_key)?;
        }
        Ok(Some(crypto))
    }

    /// Trim values and treat blank or placeholder (`-`) ones as unset
    fn normalized(mut self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty() && v != "-")
        }
        self.app_secret = clean(self.app_secret);
        self.encoding_aes_key = clean(self.encoding_aes_key);
        self.old_encoding_aes_key = clean(self.old_encoding_aes_key);
        self
    }
}
