// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Webhook alert sink.
//!
//! POSTs each alert as JSON. The body is signed with HMAC-SHA256 under a
//! shared secret and the signature sent as
//! `X-Opguard-Signature: sha256=<hex>`, so receivers can reject forged alerts.
//!
//! Endpoints must be HTTPS; plain HTTP is accepted only for loopback hosts.

use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use url::Url;

use super::escalation::{AlertSink, EscalationError, SecurityAlert};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Opguard-Signature";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookNotifier {
    client: Client,
    endpoint: Url,
    mac: HmacSha256,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

impl WebhookNotifier {
    pub fn new(endpoint: Url, secret: &[u8]) -> Result<Self, EscalationError> {
        match endpoint.scheme() {
            "https" => {}
            "http" if is_loopback(&endpoint) => {}
            scheme => {
                return Err(EscalationError::InvalidEndpoint(format!(
                    "{scheme} endpoints are not allowed: {endpoint}"
                )))
            }
        }
        if secret.is_empty() {
            return Err(EscalationError::InvalidEndpoint(
                "webhook secret must not be empty".to_string(),
            ));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| EscalationError::InvalidEndpoint(e.to_string()))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EscalationError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            mac,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Signature header value for `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl AlertSink for WebhookNotifier {
    async fn deliver(&self, alert: &SecurityAlert) -> Result<(), EscalationError> {
        let body =
            serde_json::to_vec(alert).map_err(|e| EscalationError::Delivery(e.to_string()))?;
        let signature = self.sign(&body);

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| EscalationError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EscalationError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> WebhookNotifier {
        WebhookNotifier::new(
            Url::parse("https://alerts.example.com/hook").unwrap(),
            b"webhook-secret",
        )
        .unwrap()
    }

    #[test]
    fn signature_is_hmac_of_body() {
        let notifier = notifier();
        let signature = notifier.sign(b"{\"action\":\"lockout_entered\"}");
        let hex_part = signature.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(b"webhook-secret").unwrap();
        mac.update(b"{\"action\":\"lockout_entered\"}");
        assert!(mac.verify_slice(&hex::decode(hex_part).unwrap()).is_ok());

        assert_ne!(signature, notifier.sign(b"{}"));
    }

    #[test]
    fn endpoint_scheme_rules() {
        let plain = Url::parse("http://alerts.example.com/hook").unwrap();
        assert!(matches!(
            WebhookNotifier::new(plain, b"s"),
            Err(EscalationError::InvalidEndpoint(_))
        ));

        let loopback = Url::parse("http://127.0.0.1:9000/hook").unwrap();
        assert!(WebhookNotifier::new(loopback, b"s").is_ok());

        let ftp = Url::parse("ftp://alerts.example.com").unwrap();
        assert!(WebhookNotifier::new(ftp, b"s").is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let url = Url::parse("https://alerts.example.com/hook").unwrap();
        assert!(WebhookNotifier::new(url, b"").is_err());
    }
}
