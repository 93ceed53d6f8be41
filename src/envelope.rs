//! Encrypted envelope wire objects
//!
//! Inbound: `<xml><ToUserName/><Encrypt/></xml>` posted by the platform.
//! Outbound: `<xml><Encrypt/><MsgSignature/><TimeStamp/><Nonce/></xml>`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Decrypted, KeySlot, WechatCrypto};
use crate::error::{EnvelopeError, EnvelopeResult};
use crate::message::push_cdata;

/// Encrypted message body posted by the platform
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "xml")]
pub struct EncryptedRequest {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: Option<String>,
    #[serde(rename = "Encrypt")]
    pub encrypt: String,
}

impl EncryptedRequest {
    pub fn from_xml(xml: &str) -> EnvelopeResult<Self> {
        Ok(serde_xml_rs::from_str(xml)?)
    }
}

/// Signed, encrypted envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "xml")]
pub struct Envelope {
    #[serde(rename = "Encrypt")]
    pub encrypt: String,
    #[serde(rename = "MsgSignature")]
    pub msg_signature: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp: String,
    #[serde(rename = "Nonce")]
    pub nonce: String,
}

impl Envelope {
    /// Encrypt `plaintext` with the key in `slot` and sign the result
    ///
    /// A missing or empty timestamp defaults to now, a missing nonce to a
    /// fresh random one.
    pub fn seal(
        crypto: &WechatCrypto,
        token: &str,
        slot: KeySlot,
        plaintext: &[u8],
        timestamp: Option<&str>,
        nonce: Option<&str>,
    ) -> EnvelopeResult<Self> {
        let encrypt = crypto.encrypt_with(slot, plaintext)?;

        let timestamp = match timestamp {
            Some(ts) if !ts.is_empty() => ts.to_string(),
            _ => Utc::now().timestamp().to_string(),
        };
        let nonce = match nonce {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => crypto::random_nonce(),
        };

        let msg_signature = crypto::sign(token, &timestamp, &nonce, &encrypt);

        Ok(Self {
            encrypt,
            msg_signature,
            timestamp,
            nonce,
        })
    }

    /// Check `msg_signature` against `token`
    pub fn verify(&self, token: &str) -> EnvelopeResult<()> {
        if crypto::verify_signature(
            &self.msg_signature,
            token,
            &self.timestamp,
            &self.nonce,
            &self.encrypt,
        ) {
            Ok(())
        } else {
            Err(EnvelopeError::SignatureMismatch)
        }
    }

    /// Verify then decrypt
    pub fn open(&self, crypto: &WechatCrypto, token: &str) -> EnvelopeResult<Decrypted> {
        self.verify(token)?;
        crypto.decrypt(&self.encrypt)
    }

    pub fn from_xml(xml: &str) -> EnvelopeResult<Self> {
        Ok(serde_xml_rs::from_str(xml)?)
    }

    /// Render as the platform expects it
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(self.encrypt.len() + 160);
        out.push_str("<xml>");
        push_cdata(&mut out, "Encrypt", &self.encrypt);
        push_cdata(&mut out, "MsgSignature", &self.msg_signature);
        out.push_str("<TimeStamp>");
        out.push_str(&self.timestamp);
        out.push_str("</TimeStamp>");
        push_cdata(&mut out, "Nonce", &self.nonce);
        out.push_str("</xml>");
        out
    }
}
