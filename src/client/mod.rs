//! HTTP client used by the `timecard` terminal front end.

pub mod state;

use std::time::{Duration, Instant};

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use crate::api::{
    HistoryResponse, LogoResponse, LogoUploadResponse, MessageResponse, StopResponse, TodayResponse,
    TokenResponse,
};
use crate::error::ErrorMessage;
use crate::tracker::DayTotal;

pub const DEFAULT_BASE_URL: &str = "http://localhost:4000";
pub const WORKDAY_SECONDS: i64 = 8 * 60 * 60;
const PROGRESS_WIDTH: usize = 20;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not logged in. Run `timecard login <email>` first.")]
    NotLoggedIn,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{message} ({status})")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        ApiClient {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends with the stored bearer token, refusing up front when there is none.
    async fn send_authed<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let token = self.token.as_deref().ok_or(ClientError::NotLoggedIn)?;
        self.send(req.bearer_auth(token)).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res.json::<T>().await?);
        }

        let message = res
            .json::<ErrorMessage>()
            .await
            .map(|body| body.message)
            .unwrap_or_else(|_| status.to_string());

        if status == StatusCode::UNAUTHORIZED {
            Err(ClientError::Unauthorized(message))
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<MessageResponse, ClientError> {
        let body = json!({ "email": email, "password": password, "fullName": full_name });
        self.send(self.http.post(self.url("/auth/register")).json(&body))
            .await
    }

    /// Returns a fresh bearer token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ClientError> {
        let body = json!({ "email": email, "password": password });
        let res: TokenResponse = self
            .send(self.http.post(self.url("/auth/login")).json(&body))
            .await?;
        Ok(res.token)
    }

    pub async fn start(&self) -> Result<MessageResponse, ClientError> {
        self.send_authed(self.http.post(self.url("/time/start"))).await
    }

    pub async fn stop(&self) -> Result<StopResponse, ClientError> {
        self.send_authed(self.http.post(self.url("/time/end"))).await
    }

    pub async fn today(&self) -> Result<TodayResponse, ClientError> {
        self.send_authed(self.http.get(self.url("/time/today"))).await
    }

    pub async fn history(&self, days: Option<i64>) -> Result<Vec<DayTotal>, ClientError> {
        let mut req = self.http.get(self.url("/time/history"));
        if let Some(days) = days {
            req = req.query(&[("days", days)]);
        }
        let res: HistoryResponse = self.send_authed(req).await?;
        Ok(res.history)
    }

    pub async fn logo_url(&self) -> Result<String, ClientError> {
        let res: LogoResponse = self.send(self.http.get(self.url("/admin/logo"))).await?;
        Ok(res.logo_url)
    }

    pub async fn upload_logo(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, ClientError> {
        let part = Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(content_type)?;
        let form = Form::new().part("file", part);

        let res: LogoUploadResponse = self
            .send_authed(self.http.post(self.url("/admin/logo")).multipart(form))
            .await?;
        Ok(res.logo_url)
    }
}

/// MIME type the server expects for a logo file, judged by extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_seconds(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// A text bar of the share of an 8 hour workday, capped at full.
pub fn format_progress(seconds: i64) -> String {
    let ratio = (seconds.max(0) as f64 / WORKDAY_SECONDS as f64).min(1.0);
    let filled = (ratio * PROGRESS_WIDTH as f64).round() as usize;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        ".".repeat(PROGRESS_WIDTH - filled),
        (ratio * 100.0).round() as u32
    )
}

/// Today's total as last reported by the server, advanced locally while running.
#[derive(Debug, Clone, Copy)]
pub struct LiveTimer {
    total_seconds: i64,
    running: bool,
    synced_at: Instant,
}

impl LiveTimer {
    pub fn new(today: &TodayResponse, now: Instant) -> Self {
        LiveTimer {
            total_seconds: today.total_seconds,
            running: today.running,
            synced_at: now,
        }
    }

    pub fn reconcile(&mut self, today: &TodayResponse, now: Instant) {
        *self = LiveTimer::new(today, now);
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn elapsed(&self, now: Instant) -> i64 {
        if !self.running {
            return self.total_seconds;
        }
        let drift = now
            .checked_duration_since(self.synced_at)
            .unwrap_or(Duration::ZERO);
        self.total_seconds + drift.as_secs() as i64
    }
}
