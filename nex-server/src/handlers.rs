//! HTTP and WebSocket handlers

use std::path::PathBuf;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::WebSocketUpgrade,
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nex_core::auth::verify_password;
use nex_core::TokenPurpose;

use crate::session;
use crate::state::AppState;

/// Error response with a JSON body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Health check endpoint
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nex-server",
        "sessions": state.hub.sessions().await.len(),
    }))
}

/// Login request body
#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    token: String,
}

/// Exchange credentials for a login token
pub async fn login_handler(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(req) = body.map_err(|e| {
        tracing::debug!("Rejected login body: {}", e);
        ApiError::new(StatusCode::BAD_REQUEST, "Invalid request body")
    })?;

    let user = &state.config.user;
    let Some(phc) = user.password_hash.clone() else {
        tracing::warn!("Login attempted but no password hash is configured");
        return Err(ApiError::unauthorized());
    };

    // argon2 verification blocks
    let password = req.password;
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &phc))
        .await
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))?;

    if req.username != user.username || verified.is_err() {
        tracing::info!("Failed login for {:?}", req.username);
        return Err(ApiError::unauthorized());
    }

    let token = state.auth.issue(&req.username, TokenPurpose::Login).map_err(|e| {
        tracing::error!("Failed to issue login token: {}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    })?;

    tracing::info!("{} logged in", req.username);
    Ok(Json(LoginResponse { token }))
}

#[derive(Serialize)]
pub struct SocketGrant {
    object: &'static str,
    data: SocketGrantData,
}

#[derive(Serialize)]
pub struct SocketGrantData {
    token: String,
    socket: String,
}

/// Trade a login token for a short-lived session token and a socket URL
pub async fn websocket_token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SocketGrant>, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(ApiError::unauthorized)?;

    let claims = state
        .auth
        .expect_purpose(bearer, TokenPurpose::Login)
        .map_err(|e| {
            tracing::debug!("Rejected login token: {}", e);
            ApiError::unauthorized()
        })?;

    let token = state.auth.issue(&claims.sub, TokenPurpose::Session).map_err(|e| {
        tracing::error!("Failed to issue session token: {}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    })?;

    let socket = format!(
        "{}/v1/monitor/{}/ws",
        state.config.server.socket_base_url(),
        Uuid::new_v4()
    );

    Ok(Json(SocketGrant {
        object: "websocket_token",
        data: SocketGrantData { token, socket },
    }))
}

/// WebSocket upgrade handler. Authentication happens in-band.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(socket_id): Path<Uuid>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    tracing::debug!("Upgrading socket {}", socket_id);
    let ctx = state.session_context();

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session::spawn(ctx, sink, stream);
    })
}

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
];

/// Serve a local album-art file named by its base64url-encoded path
pub async fn image_handler(Path(encoded): Path<String>) -> Result<Response, ApiError> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "Not found");

    let decoded = base64::engine::general_purpose::URL_SAFE
        .decode(encoded.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Invalid path encoding"))?;

    let path = PathBuf::from(decoded);
    if !path.is_absolute() {
        return Err(not_found());
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(not_found)?;
    let (_, mime) = IMAGE_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .ok_or_else(not_found)?;

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        tracing::debug!("Cannot serve {}: {}", path.display(), e);
        not_found()
    })?;

    Ok(([(header::CONTENT_TYPE, *mime)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use nex_core::auth::hash_password;
    use nex_core::{Config, JwtAuth};

    use super::*;
    use crate::hub::{Hub, HubSettings};
    use crate::testing::{FakeCommands, FakeTelemetry};

    const SECRET: &[u8] = b"handler-test-secret";

    fn test_state(password: Option<&str>) -> AppState {
        let mut config = Config::default();
        config.server.public_socket_url = Some("wss://host.example:9384/".to_string());
        config.user.password_hash = password.map(|p| hash_password(p).unwrap());

        let hub = Hub::spawn(Arc::new(FakeTelemetry::default()), HubSettings::default());
        AppState::new(
            JwtAuth::new(SECRET, None, None),
            hub,
            Arc::new(FakeCommands::default()),
            config,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::post("/v1/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = crate::app(test_state(None));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "nex-server");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_login_issues_login_token() {
        let state = test_state(Some("hunter2"));
        let auth = state.auth.clone();
        let app = crate::app(state);

        let response = app
            .oneshot(login_request(r#"{"username":"admin","password":"hunter2"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let claims = auth.validate(body["token"].as_str().unwrap()).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.purpose, TokenPurpose::Login);
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let app = crate::app(test_state(Some("hunter2")));

        for body in [
            r#"{"username":"admin","password":"wrong"}"#,
            r#"{"username":"root","password":"hunter2"}"#,
        ] {
            let response = app.clone().oneshot(login_request(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_login_without_configured_hash() {
        let app = crate::app(test_state(None));

        let response = app
            .oneshot(login_request(r#"{"username":"admin","password":"admin"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_bad_body() {
        let app = crate::app(test_state(None));

        for body in ["not json", r#"{"username":"admin"}"#] {
            let response = app.clone().oneshot(login_request(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    fn token_request(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::get("/v1/websocket");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_websocket_token_grant() {
        let state = test_state(None);
        let auth = state.auth.clone();
        let login = auth.issue("admin", TokenPurpose::Login).unwrap();
        let app = crate::app(state);

        let response = app
            .oneshot(token_request(Some(&format!("Bearer {login}"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "websocket_token");

        let claims = auth.validate(body["data"]["token"].as_str().unwrap()).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.purpose, TokenPurpose::Session);

        let socket = body["data"]["socket"].as_str().unwrap();
        let id = socket
            .strip_prefix("wss://host.example:9384/v1/monitor/")
            .and_then(|rest| rest.strip_suffix("/ws"))
            .unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_websocket_token_requires_login_token() {
        let state = test_state(None);
        let session = state.auth.issue("admin", TokenPurpose::Session).unwrap();
        let app = crate::app(state);

        let session_bearer = format!("Bearer {session}");
        for authorization in [None, Some("Basic YWRtaW46YWRtaW4="), Some("Bearer garbage"), Some(session_bearer.as_str())] {
            let response = app.clone().oneshot(token_request(authorization)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{authorization:?}");
        }
    }

    fn image_request(path: &str) -> Request<Body> {
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(path);
        Request::get(format!("/v1/img/tmp/{encoded}"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_image_served_by_encoded_path() {
        let dir = tempfile::tempdir().unwrap();
        let cover = dir.path().join("cover.PNG");
        std::fs::write(&cover, b"\x89PNG fake").unwrap();
        let app = crate::app(test_state(None));

        let response = app.oneshot(image_request(cover.to_str().unwrap())).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_image_refuses_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("notes.txt");
        std::fs::write(&secret, "private").unwrap();
        let app = crate::app(test_state(None));

        for path in [secret.to_str().unwrap(), "/definitely/missing.jpg", "relative/cover.png"] {
            let response = app.clone().oneshot(image_request(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_image_bad_encoding() {
        let app = crate::app(test_state(None));

        let response = app
            .oneshot(Request::get("/v1/img/tmp/!!not-base64!!").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
