use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";
pub const WEBHOOK_TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const USER_AGENT: &str = concat!("conveyor-webhooks/", env!("CARGO_PKG_VERSION"));

/// Header value `t={ts},v1={hex}`. Receivers recompute the mac over
/// `"{ts}.{body}"` with their copy of the secret and compare digests.
pub fn signature_header(secret: &str, ts: i64, body: &str) -> String {
    format!("t={},v1={}", ts, sign_v1(secret, ts, body))
}

pub fn sign_v1(secret: &str, ts: i64, body: &str) -> String {
    let mut msg = Vec::with_capacity(24 + body.len());
    msg.extend_from_slice(ts.to_string().as_bytes());
    msg.push(b'.');
    msg.extend_from_slice(body.as_bytes());

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(&msg);
    hex::encode(mac.finalize().into_bytes())
}
