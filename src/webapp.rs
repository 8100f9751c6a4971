//! HTTP client for the external web application that owns device identity
//! and attendance/access-control log storage.
//!
//! All three endpoints are POSTed to as JSON; responses are read back as
//! JSON only where the caller needs a field out of the body (`token`,
//! `reason`). This client never retries — per SPEC_FULL.md §7, retries are
//! the device's or application's responsibility, not the broker's.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Thin wrapper around a pooled `reqwest::Client` pointed at one web application.
#[derive(Clone)]
pub struct WebAppClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct CheckRegistrationBody<'a> {
    sn: &'a str,
    terminal_type: Option<&'a str>,
    product_name: Option<&'a str>,
    cloud_id: Option<&'a str>,
}

#[derive(Serialize)]
struct CheckLoginBody<'a> {
    sn: Option<&'a str>,
    token: Option<&'a str>,
}

/// Outcome of `POST /device/check_registration`.
pub struct RegistrationOutcome {
    pub succeeded: bool,
    pub token: Option<String>,
}

/// Outcome of `POST /device/check_login`.
pub struct LoginOutcome {
    pub succeeded: bool,
    /// `Result` value to echo back to the device: `OK`, a webapp-supplied
    /// `reason`, or `Fail` when no reason was given.
    pub result: String,
}

impl WebAppClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http, base_url: base_url.into() })
    }

    /// Returns `None` when the webapp couldn't be reached or answered with
    /// something that isn't valid JSON — the worker sends no reply for
    /// those, same as a parse failure on the device's own frame. A `Some`
    /// always carries a reply to send, `Fail` included.
    pub async fn check_registration(
        &self,
        sn: &str,
        terminal_type: Option<&str>,
        product_name: Option<&str>,
        cloud_id: Option<&str>,
    ) -> Option<RegistrationOutcome> {
        let url = format!("{}/device/check_registration", self.base_url);
        let body = CheckRegistrationBody { sn, terminal_type, product_name, cloud_id };

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, sn, "check_registration request failed");
                return None;
            }
        };

        if !resp.status().is_success() {
            return Some(RegistrationOutcome { succeeded: false, token: None });
        }

        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, sn, "check_registration response was not valid JSON");
                return None;
            }
        };

        let token = body.get("token").and_then(Value::as_str).map(str::to_owned);
        let succeeded = token.as_deref().is_some_and(|t| !t.is_empty());
        Some(RegistrationOutcome { succeeded, token })
    }

    /// Returns `None` when the webapp couldn't be reached at all — the
    /// worker sends no reply for that. A non-2xx response still produces a
    /// `Some` carrying `Fail` (or the webapp's `reason`), even if its body
    /// turns out not to be valid JSON.
    pub async fn check_login(&self, sn: Option<&str>, token: Option<&str>) -> Option<LoginOutcome> {
        let url = format!("{}/device/check_login", self.base_url);
        let body = CheckLoginBody { sn, token };

        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, sn, "check_login request failed");
                return None;
            }
        };

        if resp.status().is_success() {
            return Some(LoginOutcome { succeeded: true, result: crate::xml::RESULT_OK.to_string() });
        }

        let reason = resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("reason").and_then(Value::as_str).map(str::to_owned))
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| crate::xml::RESULT_FAIL.to_string());

        Some(LoginOutcome { succeeded: false, result: reason })
    }

    /// `POST /device/upload_log?type={event}` with the flattened child-tag map.
    /// Returns `true` on HTTP success.
    pub async fn upload_log(&self, event: &str, data: &Value) -> bool {
        let url = format!("{}/device/upload_log", self.base_url);
        let resp = self
            .http
            .post(&url)
            .query(&[("type", event)])
            .json(data)
            .send()
            .await;

        match resp {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                warn!(err = %e, event, "upload_log request failed");
                false
            }
        }
    }
}
