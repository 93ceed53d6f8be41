//! WeChat Official Account message crypto and webhook
//!
//! Implements the platform's secure-mode callback envelope: AES-256-CBC
//! frames carrying the AppID, SHA-1 signatures over the sorted
//! token/timestamp/nonce/ciphertext, and the XML wrappers around them.
//!
//! # Flow
//!
//! ```text
//! WeChat Server ──POST {path}?signature&msg_signature&encrypt_type=aes──▶ webhook
//!                                                                          │
//!           Envelope::open ◀── EncryptedRequest ◀──────────────────────────┤
//!           Message ──▶ MessageHandler ──▶ Reply ──▶ Envelope::seal ───────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! export WEIXIN_TOKEN=your_token
//! export WEIXIN_APP_ID=wx1234567890abcdef
//! export WEIXIN_ENCODING_AES_KEY=your_43_char_key  # optional, plain mode without it
//!
//! weixin-mp
//! ```

pub mod api;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod message;
pub mod webhook;

pub use api::{AccessToken, ApiClient, ApiError, ApiReply};
pub use config::WeixinConfig;
pub use crypto::{AesKey, Decrypted, KeySlot, WechatCrypto};
pub use envelope::{EncryptedRequest, Envelope};
pub use error::{EnvelopeError, EnvelopeResult};
pub use message::{Message, MsgType, Reply};
pub use webhook::{EchoHandler, MessageHandler, WebhookState};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::WeixinConfig;
    pub use crate::crypto::{KeySlot, WechatCrypto};
    pub use crate::envelope::Envelope;
    pub use crate::error::{EnvelopeError, EnvelopeResult};
    pub use crate::message::{Message, MsgType, Reply};
    pub use crate::webhook::{MessageHandler, WebhookState};
}
