//! Official Account webhook HTTP handlers
//!
//! - GET: one-time URL verification, echo `echostr` back when the signature matches
//! - POST: message delivery, plain or `encrypt_type=aes`
//!
//! Failed POSTs are logged and answered with an empty body so nothing about
//! the failure reaches the caller.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State, rejection::QueryRejection},
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::WeixinConfig;
use crate::crypto::{self, WechatCrypto};
use crate::envelope::{EncryptedRequest, Envelope};
use crate::error::{EnvelopeError, EnvelopeResult};
use crate::message::{Message, MsgType, Reply};

const ENCRYPT_TYPE_AES: &str = "aes";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

// =============================================================================
// Message handling seam
// =============================================================================

/// Produces the passive reply for an inbound message
///
/// Returning `None` acknowledges the message without a reply.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Option<Reply>;
}

/// Echoes text messages back to the sender
#[derive(Debug, Default, Clone)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn handle(&self, message: &Message) -> Option<Reply> {
        match message.kind() {
            MsgType::Text => message.content.as_ref().map(Reply::text),
            _ => None,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// WeChat webhook verification parameters (GET request)
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyParams {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub echostr: String,
}

/// Message parameters (POST request)
#[derive(Debug, Clone, Deserialize)]
pub struct MessageParams {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    #[serde(default)]
    pub encrypt_type: Option<String>,
    #[serde(default)]
    pub msg_signature: Option<String>,
}

/// Webhook server state
#[derive(Clone)]
pub struct WebhookState {
    pub config: Arc<WeixinConfig>,
    pub crypto: Option<WechatCrypto>,
    pub handler: Arc<dyn MessageHandler>,
}

impl WebhookState {
    pub fn new(config: WeixinConfig, handler: Arc<dyn MessageHandler>) -> EnvelopeResult<Self> {
        config.validate()?;
        let crypto = config.crypto()?;
        Ok(Self {
            config: Arc::new(config),
            crypto,
            handler,
        })
    }
}

/// Build the webhook router
pub fn router(state: WebhookState) -> Router {
    let path = state.config.webhook_path.clone();

    Router::new()
        .route(&path, get(verify).post(handle_message))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Run the webhook HTTP server
pub async fn run_server(addr: SocketAddr, state: WebhookState) -> anyhow::Result<()> {
    match &state.crypto {
        Some(crypto) => info!(
            "Message encryption enabled for {} (previous key: {})",
            crypto.app_id(),
            crypto.has_rotated_key()
        ),
        None => warn!("EncodingAESKey not configured, accepting plain messages only"),
    }

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Middleware to log all incoming HTTP requests
async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("🌐 HTTP {} {}", method, path);

    let response = next.run(req).await;

    debug!("📤 {} {} -> {}", method, path, response.status());

    response
}

/// Webhook verification (GET request)
async fn verify(
    State(state): State<WebhookState>,
    params: Result<Query<VerifyParams>, QueryRejection>,
) -> Result<String, StatusCode> {
    let Query(params) = params.map_err(|e| {
        warn!("Malformed verification query: {}", e);
        StatusCode::BAD_REQUEST
    })?;

    info!(
        "📥 Verification request: timestamp={}, nonce={}",
        params.timestamp, params.nonce
    );

    if !crypto::verify_signature(
        &params.signature,
        &state.config.token,
        &params.timestamp,
        &params.nonce,
        "",
    ) {
        warn!("Invalid signature in verification request");
        return Err(StatusCode::FORBIDDEN);
    }

    info!("Webhook verification successful");
    Ok(params.echostr)
}

/// Handle incoming message (POST request)
async fn handle_message(
    State(state): State<WebhookState>,
    params: Result<Query<MessageParams>, QueryRejection>,
    body: Bytes,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(e) => {
            warn!("Malformed message query: {}", e);
            return String::new().into_response();
        }
    };

    debug!(
        "📥 Message: timestamp={}, nonce={}, encrypt_type={:?}, body={} bytes",
        params.timestamp,
        params.nonce,
        params.encrypt_type,
        body.len()
    );

    match process_message(&state, &params, &body) {
        Ok(Some(xml)) => ([(header::CONTENT_TYPE, XML_CONTENT_TYPE)], xml).into_response(),
        Ok(None) => "success".into_response(),
        Err(EnvelopeError::Encrypt(e)) => {
            error!("Failed to encrypt reply: {}", e);
            String::new().into_response()
        }
        Err(e) => {
            warn!("Rejected message: {}", e);
            String::new().into_response()
        }
    }
}

/// Verify, decrypt, dispatch and render the reply
///
/// `Ok(None)` means the handler had nothing to say.
fn process_message(
    state: &WebhookState,
    params: &MessageParams,
    body: &[u8],
) -> EnvelopeResult<Option<String>> {
    let token = &state.config.token;

    if !crypto::verify_signature(&params.signature, token, &params.timestamp, &params.nonce, "") {
        return Err(EnvelopeError::SignatureMismatch);
    }

    let body = String::from_utf8_lossy(body);

    if params.encrypt_type.as_deref() != Some(ENCRYPT_TYPE_AES) {
        let message = parse_message(state, &body)?;
        return Ok(state
            .handler
            .handle(&message)
            .map(|reply| message.reply(&reply)));
    }

    let crypto = state.crypto.as_ref().ok_or_else(|| {
        EnvelopeError::Config("encrypted message received but no EncodingAESKey is set".into())
    })?;
    let msg_signature = params
        .msg_signature
        .as_deref()
        .ok_or(EnvelopeError::SignatureMismatch)?;

    let encrypted = EncryptedRequest::from_xml(&body)?;
    if !crypto::verify_signature(
        msg_signature,
        token,
        &params.timestamp,
        &params.nonce,
        &encrypted.encrypt,
    ) {
        return Err(EnvelopeError::SignatureMismatch);
    }

    let decrypted = crypto.decrypt(&encrypted.encrypt)?;
    let message = parse_message(state, &String::from_utf8_lossy(&decrypted.payload))?;

    let Some(reply) = state.handler.handle(&message) else {
        return Ok(None);
    };

    let envelope = Envelope::seal(
        crypto,
        token,
        decrypted.slot,
        message.reply(&reply).as_bytes(),
        None,
        Some(&params.nonce),
    )?;
    Ok(Some(envelope.to_xml()))
}

fn parse_message(state: &WebhookState, xml: &str) -> EnvelopeResult<Message> {
    if state.config.debug_mode {
        debug!("Raw XML content: {}", xml);
    }

    let message = Message::from_xml(xml)?;
    info!(
        "Received {} message from user {}",
        message.msg_type, message.from_user_name
    );
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose;

    const TOKEN: &str = "spamtest";
    const APP_ID: &str = "wx2c2769f8efd9abc2";
    const KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";
    const TIMESTAMP: &str = "1409735669";
    const NONCE: &str = "1320562132";

    const TEXT_XML: &str = "<xml><ToUserName><![CDATA[gh_10f6c3c3ac5a]]></ToUserName>\
        <FromUserName><![CDATA[oyORnuP8q7ou2gfYjqLzSIWZf0rs]]></FromUserName>\
        <CreateTime>1409735668</CreateTime><MsgType><![CDATA[text]]></MsgType>\
        <Content><![CDATA[hello]]></Content><MsgId>6054768590064713728</MsgId></xml>";

    fn config(encoding_aes_key: Option<&str>) -> WeixinConfig {
        WeixinConfig {
            host: "api.weixin.qq.com".to_string(),
            app_id: APP_ID.to_string(),
            app_secret: None,
            token: TOKEN.to_string(),
            encoding_aes_key: encoding_aes_key.map(str::to_string),
            old_encoding_aes_key: None,
            webhook_addr: "127.0.0.1:0".to_string(),
            webhook_path: "/weixin".to_string(),
            debug_mode: true,
        }
    }

    fn state(encoding_aes_key: Option<&str>) -> WebhookState {
        WebhookState::new(config(encoding_aes_key), Arc::new(EchoHandler)).unwrap()
    }

    fn params(encrypt: Option<&str>) -> MessageParams {
        MessageParams {
            signature: crypto::sign(TOKEN, TIMESTAMP, NONCE, ""),
            timestamp: TIMESTAMP.to_string(),
            nonce: NONCE.to_string(),
            encrypt_type: encrypt.map(|_| "aes".to_string()),
            msg_signature: encrypt.map(|e| crypto::sign(TOKEN, TIMESTAMP, NONCE, e)),
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn encrypted_body(ciphertext: &str) -> Bytes {
        Bytes::from(format!(
            "<xml><ToUserName><![CDATA[gh_10f6c3c3ac5a]]></ToUserName><Encrypt><![CDATA[{}]]></Encrypt></xml>",
            ciphertext
        ))
    }

    #[tokio::test]
    async fn test_verify_echoes_echostr() {
        let params = VerifyParams {
            signature: "16120ec1b8dbb870f510d87ce6bc2463eae6ca1a".to_string(),
            timestamp: TIMESTAMP.to_string(),
            nonce: NONCE.to_string(),
            echostr: "5837397520665436492".to_string(),
        };

        let echoed = verify(State(state(None)), Ok(Query(params))).await.unwrap();
        assert_eq!(echoed, "5837397520665436492");
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_signature() {
        let params = VerifyParams {
            signature: "0".repeat(40),
            timestamp: TIMESTAMP.to_string(),
            nonce: NONCE.to_string(),
            echostr: "echo".to_string(),
        };

        let result = verify(State(state(None)), Ok(Query(params))).await;
        assert_eq!(result.unwrap_err(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_plain_message_reply() {
        let response = handle_message(
            State(state(None)),
            Ok(Query(params(None))),
            Bytes::from_static(TEXT_XML.as_bytes()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            XML_CONTENT_TYPE
        );

        let reply = Message::from_xml(&body_string(response).await).unwrap();
        assert_eq!(reply.to_user_name, "oyORnuP8q7ou2gfYjqLzSIWZf0rs");
        assert_eq!(reply.from_user_name, "gh_10f6c3c3ac5a");
        assert_eq!(reply.content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_encrypted_message_reply() {
        let state = state(Some(KEY));
        let crypto = state.crypto.clone().unwrap();
        let ciphertext = crypto.encrypt(TEXT_XML.as_bytes()).unwrap();

        let response = handle_message(
            State(state),
            Ok(Query(params(Some(&ciphertext)))),
            encrypted_body(&ciphertext),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let envelope = Envelope::from_xml(&body_string(response).await).unwrap();
        assert_eq!(envelope.nonce, NONCE);

        let decrypted = envelope.open(&crypto, TOKEN).unwrap();
        let reply = Message::from_xml(std::str::from_utf8(&decrypted.payload).unwrap()).unwrap();
        assert_eq!(reply.to_user_name, "oyORnuP8q7ou2gfYjqLzSIWZf0rs");
        assert_eq!(reply.content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_platform_sample_is_accepted() {
        // Captured callback; its payload is a text message "abcdteT"
        let ciphertext = "hyzAe4OzmOMbd6TvGdIOO6uBmdJoD0Fk53REIHvxYtJlE2B655HuD0m8KUePWB3+LrPXo87wzQ1QLvbeUgmBM4x6F8PGHQHFVAFmOD2LdJF9FrXpbUAh0B5GIItb52sn896wVsMSHGuPE328HnRGBcrS7C41IzDWyWNlZkyyXwon8T332jisa+h6tEDYsVticbSnyU8dKOIbgU6ux5VTjg3yt+WGzjlpKn6NPhRjpA912xMezR4kw6KWwMrCVKSVCZciVGCgavjIQ6X8tCOp3yZbGpy0VxpAe+77TszTfRd5RJSVO/HTnifJpXgCSUdUue1v6h0EIBYYI1BD1DlD+C0CR8e6OewpusjZ4uBl9FyJvnhvQl+q5rv1ixrcpCumEPo5MJSgM9ehVsNPfUM669WuMyVWQLCzpu9GhglF2PE=";
        let p = params(Some(ciphertext));
        assert_eq!(
            p.msg_signature.as_deref(),
            Some("5d197aaffba7e9b25a30732f161a50dee96bd5fa")
        );

        let state = state(Some(KEY));
        let response =
            handle_message(State(state.clone()), Ok(Query(p)), encrypted_body(ciphertext)).await;

        let envelope = Envelope::from_xml(&body_string(response).await).unwrap();
        let decrypted = envelope.open(state.crypto.as_ref().unwrap(), TOKEN).unwrap();
        let reply = String::from_utf8(decrypted.payload).unwrap();
        assert!(reply.contains("<Content><![CDATA[abcdteT]]></Content>"));
    }

    #[tokio::test]
    async fn test_bad_msg_signature_gets_empty_body() {
        let state = state(Some(KEY));
        let ciphertext = state.crypto.as_ref().unwrap().encrypt(TEXT_XML.as_bytes()).unwrap();

        let mut p = params(Some(&ciphertext));
        p.msg_signature = Some(crypto::sign(TOKEN, TIMESTAMP, NONCE, "other"));

        let response = handle_message(State(state), Ok(Query(p)), encrypted_body(&ciphertext)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_bad_url_signature_gets_empty_body() {
        let mut p = params(None);
        p.signature = "deadbeef".to_string();

        let response = handle_message(
            State(state(None)),
            Ok(Query(p)),
            Bytes::from_static(TEXT_XML.as_bytes()),
        )
        .await;
        assert_eq!(body_string(response).await, "");
    }

    #[test]
    fn test_encrypted_without_key_is_config_error() {
        let ciphertext = general_purpose::STANDARD.encode([0u8; 32]);
        let result = process_message(
            &state(None),
            &params(Some(&ciphertext)),
            encrypted_body(&ciphertext).as_ref(),
        );
        assert!(matches!(result, Err(EnvelopeError::Config(_))));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let state = state(Some(KEY));
        let ciphertext = state.crypto.as_ref().unwrap().encrypt(TEXT_XML.as_bytes()).unwrap();

        // Re-signed so only decryption can catch it
        let mut raw = general_purpose::STANDARD.decode(&ciphertext).unwrap();
        let idx = raw.len() - 17;
        raw[idx] ^= 0xFF;
        let tampered = general_purpose::STANDARD.encode(raw);

        let result = process_message(
            &state,
            &params(Some(&tampered)),
            encrypted_body(&tampered).as_ref(),
        );
        assert!(matches!(result, Err(EnvelopeError::InvalidPadding(_))));
    }

    #[test]
    fn test_non_text_message_acknowledged() {
        let xml = "<xml><ToUserName>gh</ToUserName><FromUserName>openid</FromUserName>\
                   <CreateTime>1</CreateTime><MsgType>event</MsgType><Event>subscribe</Event></xml>";
        let result = process_message(&state(None), &params(None), xml.as_bytes()).unwrap();
        assert!(result.is_none());
    }

    async fn spawn_router() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let app = router(state(None));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, server)
    }

    #[tokio::test]
    async fn test_router_serves_verification_and_health() {
        let (addr, server) = spawn_router().await;

        let client = reqwest::Client::new();
        let health = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");

        let echoed = client
            .get(format!("http://{}/weixin", addr))
            .query(&[
                ("signature", "16120ec1b8dbb870f510d87ce6bc2463eae6ca1a"),
                ("timestamp", TIMESTAMP),
                ("nonce", NONCE),
                ("echostr", "hello-echo"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(echoed.status(), reqwest::StatusCode::OK);
        assert_eq!(echoed.text().await.unwrap(), "hello-echo");

        server.abort();
    }

    #[tokio::test]
    async fn test_missing_query_params_get_empty_body() {
        let (addr, server) = spawn_router().await;
        let client = reqwest::Client::new();

        let verify = client
            .get(format!("http://{}/weixin", addr))
            .query(&[("timestamp", TIMESTAMP)])
            .send()
            .await
            .unwrap();
        assert_eq!(verify.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(verify.text().await.unwrap(), "");

        let message = client
            .post(format!("http://{}/weixin", addr))
            .body(TEXT_XML)
            .send()
            .await
            .unwrap();
        assert_eq!(message.status(), reqwest::StatusCode::OK);
        assert_eq!(message.text().await.unwrap(), "");

        server.abort();
    }
}
