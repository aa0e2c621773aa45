// Copyright (C) 2026 ManorHunt
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Form, Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::{
    Host,
    cookie::{Cookie, CookieJar},
};
use hunt_common::{
    CLUE_COOKIE, ConversationState, FINAL_STOP_LABEL, GameScript, LinkContext, MessagingReply,
    STOP_COOKIE, VideoEntry, VoiceReply, substitute_next_stop,
};
use lambda_http::run as lambda_run;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

const VOICE_NAME: &str = "Polly.Kimberly-Neural";
const VOICE_GREETING: [&str; 3] = [
    "You have reached the scavenger hunt hotline.",
    "If you need help with the next step, text the word HELP to this phone number. \
     If you need a clue, text the word CLUE. If you are still stuck, just text \
     your question to this number.",
    "Goodbye!",
];

const KICKOFF_TEXT: &str =
    "It is time! Are you ready for an adventure to kick things off? Text YES or NO.";
const HELP_TEXT: &str = "Text CLUE to get another hint about where you need to go.\n\
     Text STUCK to summon additional assistance.\n\
     If you have another question, just text it to this number.\n\
     Have fun!";
const STUCK_REPLY: &str = "Help is on the way!";
const NO_NUDGE: &str =
    "Ah, c'mon now. A lot of love went into this. It'll be fun! Text YES to get going.";
const FALLBACK_TEXT: &str =
    "Text HELP for a list of the options. Text YES to start the scavenger hunt!";
const RESTART_CONFIRMATION: &str = "Game restarted. Text YES to begin again.";

#[derive(Clone)]
struct AppState {
    config: Arc<HuntConfig>,
    script: Arc<GameScript>,
    sender: Arc<dyn SmsSender>,
}

impl AppState {
    /// Delivery failure must not fail the inbound webhook reply; the player
    /// still deserves a response when a side notification misfires.
    async fn notify_player(&self, body: &str, media_url: Option<&str>) {
        if let Err(error) = self
            .sender
            .send(&self.config.player_number, body, media_url)
            .await
        {
            warn!(error = %error, "player notification failed");
        }
    }

    async fn notify_gm(&self, body: &str, media_url: Option<&str>) {
        if let Err(error) = self
            .sender
            .send(&self.config.gm_number, body, media_url)
            .await
        {
            warn!(error = %error, "game-master notification failed");
        }
    }

    fn links(&self, host: &str) -> LinkContext {
        LinkContext::new(self.config.public_scheme.clone(), host)
    }
}

#[derive(Debug, Clone)]
struct HuntConfig {
    player_number: String,
    gm_number: String,
    start_keyword: String,
    public_scheme: String,
}

impl HuntConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            player_number: require_env("TWILIO_PLAYER")?,
            gm_number: require_env("TWILIO_GM")?,
            start_keyword: env_or("HUNT_START_KEYWORD", "START").to_uppercase(),
            public_scheme: env_or("HUNT_PUBLIC_SCHEME", "https"),
        })
    }
}

#[async_trait]
trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str, media_url: Option<&str>) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct TwilioSender {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    caller_id: String,
}

impl TwilioSender {
    fn from_env() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to create messaging API client")?;
        Ok(Self {
            client,
            api_base: env_or("TWILIO_API_BASE", "https://api.twilio.com"),
            account_sid: require_env("TWILIO_ACCOUNT_SID")?,
            auth_token: require_env("TWILIO_AUTH_TOKEN")?,
            caller_id: require_env("TWILIO_CALLER_ID")?,
        })
    }
}

#[async_trait]
impl SmsSender for TwilioSender {
    async fn send(&self, to: &str, body: &str, media_url: Option<&str>) -> anyhow::Result<()> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        let mut params = vec![
            ("From", self.caller_id.as_str()),
            ("To", to),
            ("Body", body),
        ];
        if let Some(media) = media_url {
            params.push(("MediaUrl", media));
        }
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .context("failed to reach messaging API")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("messaging API returned {status}: {detail}");
        }
        info!(to = %to, "outbound message delivered");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "webhook_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = HuntConfig::from_env()?;
    let script = load_script()?;
    let state = AppState {
        config: Arc::new(config),
        script: Arc::new(script),
        sender: Arc::new(TwilioSender::from_env()?),
    };

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running webhook-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("WEBHOOK_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "webhook-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_script() -> anyhow::Result<GameScript> {
    let path = env_or("HUNT_SCRIPT_PATH", "hunt.yaml");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read hunt script {path}"))?;
    let expanded = hunt_common::expand_env_vars(&raw);
    let script = GameScript::from_yaml(&expanded)
        .with_context(|| format!("invalid hunt script {path}"))?;
    info!(path = %path, stops = script.stops.len(), "hunt script loaded");
    Ok(script)
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/voice", get(voice_handler).post(voice_handler))
        .route("/sms", get(sms_handler).post(sms_handler))
        .route("/gm", get(gm_handler).post(gm_handler))
        .route("/player", get(player_handler).post(player_handler))
        .route("/player/{stop}", get(stop_handler).post(stop_handler))
        .route("/admin", get(admin_handler).post(admin_handler))
        .route("/video/{location}", get(video_handler))
        .nest_service("/static", ServeDir::new(env_or("HUNT_STATIC_DIR", "static")))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = env_or(var_name, default);
    value.parse().context(format!("invalid {var_name}"))
}

fn require_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{name} is required"))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .unwrap_or_else(|| default.to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "webhook-service"}))
}

/// Inbound webhook payload. `Body` and `From` are required; media items
/// arrive as `NumMedia` plus `MediaUrl{i}` fields.
#[derive(Debug, Clone)]
struct InboundSms {
    from: String,
    body: String,
    media_urls: Vec<String>,
}

impl InboundSms {
    fn from_form(form: &HashMap<String, String>) -> Result<Self, ApiError> {
        let from = form
            .get("From")
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::bad_request("From is required"))?
            .to_string();
        let body = form
            .get("Body")
            .ok_or_else(|| ApiError::bad_request("Body is required"))?
            .clone();
        let media_count = form
            .get("NumMedia")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let media_urls = (0..media_count)
            .filter_map(|index| form.get(&format!("MediaUrl{index}")))
            .cloned()
            .collect();
        Ok(Self {
            from,
            body,
            media_urls,
        })
    }

    fn body_upper(&self) -> String {
        self.body.trim().to_uppercase()
    }
}

/// TwiML response body, `text/xml` like the provider expects.
#[derive(Debug)]
struct Twiml(String);

impl IntoResponse for Twiml {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, "text/xml")], self.0).into_response()
    }
}

async fn voice_handler() -> Twiml {
    let mut reply = VoiceReply::new(VOICE_NAME);
    for segment in VOICE_GREETING {
        reply.say(segment);
    }
    Twiml(reply.to_xml())
}

/// Generic SMS entry point: split game-master traffic from player traffic by
/// exact sender match, nothing else.
async fn sms_handler(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Twiml, ApiError> {
    let sms = InboundSms::from_form(&form)?;
    let target = if sms.from == state.config.gm_number {
        "/gm"
    } else {
        "/player"
    };
    Ok(Twiml(MessagingReply::redirect(target).to_xml()))
}

async fn gm_handler(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Twiml, ApiError> {
    let sms = InboundSms::from_form(&form)?;
    let upper = sms.body_upper();

    if upper.starts_with(&state.config.start_keyword) {
        state.notify_player(KICKOFF_TEXT, None).await;
        let mut reply = MessagingReply::new();
        reply.push("Message sent.");
        return Ok(Twiml(reply.to_xml()));
    }

    if upper.starts_with("ADMIN") {
        return Ok(Twiml(MessagingReply::redirect("/admin").to_xml()));
    }

    // Free-text passthrough to the player; nothing to say back.
    state.notify_player(&sms.body, None).await;
    Ok(Twiml(MessagingReply::new().to_xml()))
}

async fn player_handler(
    State(state): State<AppState>,
    Host(host): Host,
    jar: CookieJar,
    Form(form): Form<HashMap<String, String>>,
) -> Result<(CookieJar, Twiml), ApiError> {
    let sms = InboundSms::from_form(&form)?;
    let convo = conversation_state(&jar);
    let upper = sms.body_upper();

    // First match wins; the order of these checks is the dispatch contract.
    if upper.starts_with("HELP") {
        let mut reply = MessagingReply::new();
        reply.push(HELP_TEXT);
        return Ok((jar, Twiml(reply.to_xml())));
    }

    if upper.starts_with("STUCK") {
        state
            .notify_gm("Player is indicating they are stuck.", None)
            .await;
        let mut reply = MessagingReply::new();
        reply.push(STUCK_REPLY);
        return Ok((jar, Twiml(reply.to_xml())));
    }

    if upper.starts_with("ADMIN") {
        return Ok((jar, Twiml(MessagingReply::redirect("/admin").to_xml())));
    }

    if let Some(stop) = &convo.stop {
        let target = format!("/player/{stop}");
        return Ok((jar, Twiml(MessagingReply::redirect(target).to_xml())));
    }

    if upper.starts_with("YES") {
        let mut reply = MessagingReply::new();
        reply.push_segments(&state.script.onboarding, &state.links(&host));
        let first_stop = state.script.first_stop().key.clone();
        let jar = jar.add(state_cookie(STOP_COOKIE, first_stop));
        state.notify_gm("Game started.", None).await;
        return Ok((jar, Twiml(reply.to_xml())));
    }

    if upper == "NO" {
        let mut reply = MessagingReply::new();
        reply.push(NO_NUDGE);
        return Ok((jar, Twiml(reply.to_xml())));
    }

    let mut reply = MessagingReply::new();
    reply.push(FALLBACK_TEXT);
    Ok((jar, Twiml(reply.to_xml())))
}

async fn stop_handler(
    State(state): State<AppState>,
    Host(host): Host,
    Path(stop_key): Path<String>,
    jar: CookieJar,
    Form(form): Form<HashMap<String, String>>,
) -> Result<(CookieJar, Twiml), ApiError> {
    let sms = InboundSms::from_form(&form)?;
    let stop = state
        .script
        .stop(&stop_key)
        .ok_or_else(|| ApiError::not_found(format!("unknown stop {stop_key}")))?;
    let convo = conversation_state(&jar);
    let links = state.links(&host);
    let upper = sms.body_upper();

    if upper.contains("YES") {
        let mut reply = MessagingReply::new();
        reply.push_segments(&stop.introduction, &links);
        state
            .notify_gm(&format!("Video for {} delivered.", stop.key), None)
            .await;
        return Ok((jar, Twiml(reply.to_xml())));
    }

    if upper == "CLUE" {
        let clue_count = stop.clues.len() as u32;
        let index = convo.clue_index % clue_count;
        let mut reply = MessagingReply::new();
        reply.push_segments(&stop.clues[index as usize], &links);
        state
            .notify_gm(&format!("Clue {index} for {} requested.", stop.key), None)
            .await;
        let next_index = (index + 1) % clue_count;
        let jar = jar.add(state_cookie(CLUE_COOKIE, next_index.to_string()));
        return Ok((jar, Twiml(reply.to_xml())));
    }

    if !sms.media_urls.is_empty() {
        for media_url in &sms.media_urls {
            state
                .notify_gm(
                    &format!("Photo received for {}.", stop.key),
                    Some(media_url),
                )
                .await;
        }
        let label = if state.script.is_final_stop(&stop.key) || stop.victory.next.is_empty() {
            FINAL_STOP_LABEL
        } else {
            stop.victory.next.as_str()
        };
        let mut reply = MessagingReply::new();
        reply.push_segments(&substitute_next_stop(&stop.victory.messages, label), &links);
        let jar = jar
            .add(state_cookie(STOP_COOKIE, stop.victory.next.clone()))
            .add(state_cookie(CLUE_COOKIE, "0".to_string()));
        return Ok((jar, Twiml(reply.to_xml())));
    }

    // Anything else is a question for the game-master.
    state.notify_gm(&sms.body, None).await;
    Ok((jar, Twiml(MessagingReply::new().to_xml())))
}

async fn admin_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<HashMap<String, String>>,
) -> Result<(CookieJar, Twiml), ApiError> {
    let sms = InboundSms::from_form(&form)?;
    let upper = sms.body_upper();

    if upper == "ADMIN RESTART" {
        let jar = jar
            .remove(expired_cookie(STOP_COOKIE))
            .remove(expired_cookie(CLUE_COOKIE));
        state.notify_gm("Player restarted game.", None).await;
        let mut reply = MessagingReply::new();
        reply.push(RESTART_CONFIRMATION);
        return Ok((jar, Twiml(reply.to_xml())));
    }

    if let Some(rest) = upper.strip_prefix("ADMIN") {
        let index: usize = rest
            .trim()
            .parse()
            .map_err(|_| ApiError::bad_request("admin argument must be a stop index"))?;
        let stop = state
            .script
            .stop_by_index(index)
            .ok_or_else(|| ApiError::bad_request(format!("stop index {index} out of range")))?;
        // Both cookies move in the same response, so a reset can never leave
        // a stale clue counter behind.
        let jar = jar
            .add(state_cookie(STOP_COOKIE, stop.key.clone()))
            .add(state_cookie(CLUE_COOKIE, "0".to_string()));
        state
            .notify_gm(&format!("Player reset game to {}.", stop.key), None)
            .await;
        let mut reply = MessagingReply::new();
        reply.push(format!("Game reset to {}.", stop.key));
        return Ok((jar, Twiml(reply.to_xml())));
    }

    Err(ApiError::bad_request("unrecognized admin command"))
}

async fn video_handler(
    State(state): State<AppState>,
    Path(location): Path<String>,
) -> (StatusCode, Html<String>) {
    match state.script.video(&location) {
        Some(entry) => (StatusCode::OK, Html(render_video_page(entry))),
        None => (
            StatusCode::NOT_FOUND,
            Html(render_video_not_found(&location)),
        ),
    }
}

fn conversation_state(jar: &CookieJar) -> ConversationState {
    ConversationState::from_cookies(
        jar.get(STOP_COOKIE).map(|cookie| cookie.value()),
        jar.get(CLUE_COOKIE).map(|cookie| cookie.value()),
    )
}

fn state_cookie(name: &'static str, value: String) -> Cookie<'static> {
    Cookie::build((name, value)).path("/").build()
}

fn expired_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

fn render_video_page(entry: &VideoEntry) -> String {
    let poster = entry
        .thumbnail
        .as_deref()
        .map(|thumbnail| format!(" poster=\"{}\"", html_escape(thumbnail)))
        .unwrap_or_default();
    format!(
        "<!doctype html><html><head><title>{title}</title></head>\
<body><h1>{title}</h1>\
<video controls{poster}><source src=\"{file}\" type=\"video/mp4\"></video>\
</body></html>",
        title = html_escape(&entry.title),
        file = html_escape(&entry.file),
    )
}

fn render_video_not_found(location: &str) -> String {
    format!(
        "<!doctype html><html><head><title>Not Found</title></head>\
<body><h1>Video not found</h1><p>No video for <code>{}</code>.</p></body></html>",
        html_escape(location)
    )
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    /// Even failures answer with a minimal valid TwiML envelope; an HTML
    /// error page has no business inside a text-message exchange.
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (self.status, Twiml(MessagingReply::new().to_xml())).into_response()
    }
}
