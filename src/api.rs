use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use futures_util::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use crate::assets::{LogoService, LogoUpload, MAX_LOGO_BYTES};
use crate::auth::{AuthService, AuthUser, ExternalLoginRequest, LoginRequest, RegisterRequest};
use crate::error::{handle_rejection, ApiError};
use crate::ratelimit::RateLimiter;
use crate::tracker::{DayTotal, TimeTracker};

pub const LOGIN_ATTEMPTS: u32 = 5;
pub const LOGIN_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const GENERAL_REQUESTS: u32 = 300;
pub const GENERAL_WINDOW: Duration = Duration::from_secs(15 * 60);
const MAX_UPLOAD_BODY: u64 = MAX_LOGO_BYTES as u64 + 64 * 1024;

/// Counts hits per client address.
pub type ClientLimiter = RateLimiter<Option<IpAddr>>;

// Response bodies. The terminal client decodes the same types.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub message: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodayResponse {
    pub total_seconds: i64,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<DayTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoResponse {
    pub logo_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoUploadResponse {
    pub ok: bool,
    pub logo_url: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    days: Option<String>,
}

/// Everything the handlers need, cheap to clone into each filter.
#[derive(Clone)]
pub struct AppState {
    pub tracker: TimeTracker,
    pub auth: AuthService,
    pub logo: LogoService,
    pub login_limiter: Arc<ClientLimiter>,
    pub general_limiter: Arc<ClientLimiter>,
}

impl AppState {
    pub fn new(tracker: TimeTracker, auth: AuthService, logo: LogoService) -> Self {
        AppState {
            tracker,
            auth,
            logo,
            login_limiter: Arc::new(RateLimiter::new(LOGIN_ATTEMPTS, LOGIN_WINDOW)),
            general_limiter: Arc::new(RateLimiter::new(GENERAL_REQUESTS, GENERAL_WINDOW)),
        }
    }

    /// Replaces the limit applied to every API request.
    pub fn with_general_limit(mut self, max: u32, window: Duration) -> Self {
        self.general_limiter = Arc::new(RateLimiter::new(max, window));
        self
    }
}

fn message(text: &str) -> warp::reply::Json {
    warp::reply::json(&MessageResponse {
        message: text.to_string(),
    })
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(1024 * 16).and(warp::body::json())
}

fn with_tracker(tracker: TimeTracker) -> impl Filter<Extract = (TimeTracker,), Error = Infallible> + Clone {
    warp::any().map(move || tracker.clone())
}

fn with_auth(auth: AuthService) -> impl Filter<Extract = (AuthService,), Error = Infallible> + Clone {
    warp::any().map(move || auth.clone())
}

fn with_logo(logo: LogoService) -> impl Filter<Extract = (LogoService,), Error = Infallible> + Clone {
    warp::any().map(move || logo.clone())
}

/// Resolves the bearer token into the calling user, or rejects with 401.
pub fn authenticated(auth: AuthService) -> impl Filter<Extract = (AuthUser,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_auth(auth))
        .and_then(|header: Option<String>, auth: AuthService| async move {
            auth.authenticate(header.as_deref())
                .map_err(|e| Rejection::from(ApiError::from(e)))
        })
}

/// Counts the request against the caller's address, rejecting with 429 once over.
fn rate_limit(
    limiter: Arc<ClientLimiter>,
    message: &'static str,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::addr::remote()
        .and_then(move |remote: Option<SocketAddr>| {
            let limiter = limiter.clone();
            async move {
                if limiter.check(remote.map(|addr| addr.ip())) {
                    Ok(())
                } else {
                    Err(Rejection::from(ApiError::TooManyRequests(message.to_string())))
                }
            }
        })
        .untuple_one()
}

fn login_rate_limit(limiter: Arc<ClientLimiter>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    rate_limit(limiter, "Too many login attempts. Try again later.")
}

fn general_rate_limit(limiter: Arc<ClientLimiter>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    rate_limit(limiter, "Too many requests, please try again later.")
}

// Filters
pub fn register(auth: AuthService) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("auth" / "register")
        .and(warp::post())
        .and(json_body())
        .and(with_auth(auth))
        .and_then(register_handler)
}

pub fn login(
    auth: AuthService,
    limiter: Arc<ClientLimiter>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("auth" / "login")
        .and(warp::post())
        .and(login_rate_limit(limiter))
        .and(json_body())
        .and(with_auth(auth))
        .and_then(login_handler)
}

pub fn google_login(auth: AuthService) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("auth" / "google")
        .and(warp::post())
        .and(json_body())
        .and(with_auth(auth))
        .and_then(google_login_handler)
}

pub fn start_timer(
    tracker: TimeTracker,
    auth: AuthService,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("time" / "start")
        .and(warp::post())
        .and(authenticated(auth))
        .and(with_tracker(tracker))
        .and_then(start_handler)
}

pub fn end_timer(
    tracker: TimeTracker,
    auth: AuthService,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("time" / "end")
        .and(warp::post())
        .and(authenticated(auth))
        .and(with_tracker(tracker))
        .and_then(end_handler)
}

pub fn get_today(
    tracker: TimeTracker,
    auth: AuthService,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("time" / "today")
        .and(warp::get())
        .and(authenticated(auth))
        .and(with_tracker(tracker))
        .and_then(today_handler)
}

pub fn get_history(
    tracker: TimeTracker,
    auth: AuthService,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("time" / "history")
        .and(warp::get())
        .and(authenticated(auth))
        .and(warp::query::<HistoryQuery>())
        .and(with_tracker(tracker))
        .and_then(history_handler)
}

pub fn get_logo(logo: LogoService) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("admin" / "logo")
        .and(warp::get())
        .and(with_logo(logo))
        .and_then(get_logo_handler)
}

pub fn post_logo(
    logo: LogoService,
    auth: AuthService,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("admin" / "logo")
        .and(warp::post())
        .and(authenticated(auth))
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BODY))
        .and(with_logo(logo))
        .and_then(post_logo_handler)
}

pub fn health() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "ok": true })))
}

/// The JSON API, without static files, CORS or the general request limit.
pub fn api(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let AppState {
        tracker,
        auth,
        logo,
        login_limiter,
        ..
    } = state;

    register(auth.clone())
        .or(login(auth.clone(), login_limiter))
        .or(google_login(auth.clone()))
        .or(start_timer(tracker.clone(), auth.clone()))
        .or(end_timer(tracker.clone(), auth.clone()))
        .or(get_today(tracker.clone(), auth.clone()))
        .or(get_history(tracker, auth.clone()))
        .or(get_logo(logo.clone()))
        .or(post_logo(logo, auth))
        .or(health())
}

/// Static files, then the rate-limited API, with error rendering, CORS and request tracing.
/// Files that exist are served before the limit is counted.
pub fn routes(
    state: AppState,
    public_dir: PathBuf,
    frontend_origin: &str,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let uploads = warp::path("uploads").and(warp::fs::dir(state.logo.uploads_dir().to_path_buf()));
    let statics = warp::fs::dir(public_dir);

    let cors = warp::cors()
        .allow_origin(frontend_origin)
        .allow_credentials(true)
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    let limited = general_rate_limit(state.general_limiter.clone()).and(api(state));

    uploads
        .or(statics)
        .or(limited)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::trace::request())
}

// Handlers
async fn register_handler(req: RegisterRequest, auth: AuthService) -> Result<impl Reply, Rejection> {
    auth.register(&req).await.map_err(ApiError::from)?;
    Ok(message("Registered"))
}

async fn login_handler(req: LoginRequest, auth: AuthService) -> Result<impl Reply, Rejection> {
    let token = auth.login(&req).await.map_err(ApiError::from)?;
    Ok(warp::reply::json(&TokenResponse { token }))
}

async fn google_login_handler(
    req: ExternalLoginRequest,
    auth: AuthService,
) -> Result<impl Reply, Rejection> {
    let id_token = req
        .id_token
        .ok_or_else(|| ApiError::Validation("idToken is required".to_string()))?;
    let token = auth
        .sign_in_external(&id_token)
        .await
        .map_err(ApiError::from)?;
    Ok(warp::reply::json(&TokenResponse { token }))
}

async fn start_handler(user: AuthUser, tracker: TimeTracker) -> Result<impl Reply, Rejection> {
    tracker.start(user.id).await.map_err(ApiError::from)?;
    Ok(message("Started"))
}

async fn end_handler(user: AuthUser, tracker: TimeTracker) -> Result<impl Reply, Rejection> {
    let stopped = tracker.stop(user.id).await.map_err(ApiError::from)?;
    Ok(warp::reply::json(&StopResponse {
        message: "Stopped".to_string(),
        seconds: stopped.seconds,
    }))
}

async fn today_handler(user: AuthUser, tracker: TimeTracker) -> Result<impl Reply, Rejection> {
    let today = tracker.today(user.id).await.map_err(ApiError::from)?;
    Ok(warp::reply::json(&TodayResponse {
        total_seconds: today.total_seconds,
        running: today.running,
    }))
}

async fn history_handler(
    user: AuthUser,
    query: HistoryQuery,
    tracker: TimeTracker,
) -> Result<impl Reply, Rejection> {
    let days = match query.days.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ApiError::Validation("days must be a positive integer".to_string()))?,
        ),
    };

    let history = tracker.history(user.id, days).await.map_err(ApiError::from)?;
    Ok(warp::reply::json(&HistoryResponse { history }))
}

async fn get_logo_handler(logo: LogoService) -> Result<impl Reply, Rejection> {
    let logo_url = logo.logo_url().await.map_err(ApiError::from)?;
    Ok(warp::reply::json(&LogoResponse { logo_url }))
}

async fn post_logo_handler(
    _user: AuthUser,
    form: FormData,
    logo: LogoService,
) -> Result<impl Reply, Rejection> {
    let upload = read_file_part(form)
        .await?
        .ok_or_else(|| ApiError::Validation("No file uploaded".to_string()))?;

    let logo_url = logo.set_logo(upload).await.map_err(ApiError::from)?;
    Ok(warp::reply::json(&LogoUploadResponse { ok: true, logo_url }))
}

/// Collects the multipart field named `file`, ignoring any others.
async fn read_file_part(form: FormData) -> Result<Option<LogoUpload>, ApiError> {
    futures_util::pin_mut!(form);

    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| ApiError::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if part.name() != "file" {
            continue;
        }

        let filename = part.filename().map(str::to_string);
        let content_type = part.content_type().map(str::to_string);
        let data = part
            .stream()
            .try_fold(Vec::new(), |mut acc, buf| async move {
                acc.put(buf);
                Ok(acc)
            })
            .await
            .map_err(|e| ApiError::Validation(format!("Invalid multipart body: {}", e)))?;

        return Ok(Some(LogoUpload {
            filename,
            content_type,
            data,
        }));
    }

    Ok(None)
}
