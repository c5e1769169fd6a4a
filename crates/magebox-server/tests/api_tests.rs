//! Integration tests for the `MageBox` HTTP API.
//!
//! The router is driven in-process with `oneshot` against an in-memory
//! store. SSH deployment and email are replaced by recording fakes so the
//! fire-and-forget paths can be observed once background tasks drain.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use magebox_core::crypto::{self, EncryptionKey, TokenHashParams};
use magebox_core::deploy::{DeployTarget, KeyDeployer, SyncResult, UserKey};
use magebox_core::error::DeployError;
use magebox_core::ssh;
use magebox_server::bootstrap;
use magebox_server::build_router;
use magebox_server::config::{MfaPolicy, ServerConfig};
use magebox_server::notify::{Notifier, NotifyError, SecurityAlert};
use magebox_server::state::AppState;
use magebox_storage::Store;
use magebox_storage::models::{Invite, User};

const ADMIN_TOKEN: &str = "test-admin-token";
const UNREACHABLE_HOST: &str = "down.example";
const FAKE_FINGERPRINT: &str = "SHA256:ZmFrZS1ob3N0LWtleQ";

const FAST: TokenHashParams = TokenHashParams {
    memory_kib: 1024,
    iterations: 1,
    parallelism: 1,
};

// ── Fakes ────────────────────────────────────────────────────────────

/// Records every call; hosts named [`UNREACHABLE_HOST`] time out.
#[derive(Default)]
struct FakeDeployer {
    calls: Mutex<Vec<String>>,
}

impl FakeDeployer {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn reachable(target: &DeployTarget) -> Result<(), DeployError> {
        if target.host == UNREACHABLE_HOST {
            return Err(DeployError::Timeout {
                host: target.host.clone(),
                secs: 30,
            });
        }
        Ok(())
    }

    fn result(added: usize, removed: usize) -> SyncResult {
        SyncResult {
            added,
            removed,
            message: format!("added {added}, removed {removed}"),
            host_key_fingerprint: FAKE_FINGERPRINT.to_owned(),
        }
    }
}

#[async_trait]
impl KeyDeployer for FakeDeployer {
    async fn sync_environment(
        &self,
        target: &DeployTarget,
        users: &[UserKey],
    ) -> Result<SyncResult, DeployError> {
        self.record(format!("sync {} ({} users)", target.host, users.len()));
        Self::reachable(target)?;
        Ok(Self::result(users.len(), 0))
    }

    async fn add_key(&self, target: &DeployTarget, user: &UserKey) -> Result<SyncResult, DeployError> {
        self.record(format!("add {} {}", target.host, user.username));
        Self::reachable(target)?;
        Ok(Self::result(1, 0))
    }

    async fn remove_key(
        &self,
        target: &DeployTarget,
        username: &str,
    ) -> Result<SyncResult, DeployError> {
        self.record(format!("remove {} {username}", target.host));
        Self::reachable(target)?;
        Ok(Self::result(0, 1))
    }

    async fn test_connection(&self, target: &DeployTarget) -> Result<String, DeployError> {
        self.record(format!("test {}", target.host));
        Self::reachable(target)?;
        Ok(FAKE_FINGERPRINT.to_owned())
    }

    async fn host_key_fingerprint(&self, _host: &str, _port: u16) -> Result<String, DeployError> {
        Ok(FAKE_FINGERPRINT.to_owned())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_user_invited(&self, invite: &Invite, token: &str) -> Result<(), NotifyError> {
        assert!(!token.is_empty());
        self.events
            .lock()
            .unwrap()
            .push(format!("invited {}", invite.username));
        Ok(())
    }

    async fn send_user_joined(&self, user: &User) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(format!("joined {}", user.name));
        Ok(())
    }

    async fn send_security_alert(
        &self,
        _recipients: &[String],
        alert: &SecurityAlert,
    ) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("alert {} after {}", alert.kind, alert.failures));
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct TestApp {
    state: Arc<AppState>,
    router: Router,
    deployer: Arc<FakeDeployer>,
    notifier: Arc<RecordingNotifier>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn app_with(config: ServerConfig) -> TestApp {
    let store = Store::open_in_memory(EncryptionKey::generate()).await.unwrap();
    bootstrap::ensure_ca(&store, &config).await.unwrap();
    let admin_hash = crypto::hash_token_with(ADMIN_TOKEN, FAST).unwrap();

    let deployer = Arc::new(FakeDeployer::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let state = Arc::new(
        AppState::new(
            config,
            store,
            admin_hash,
            Arc::clone(&deployer) as Arc<dyn KeyDeployer>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        )
        .with_token_params(FAST),
    );
    let router = build_router(Arc::clone(&state))
        .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 7], 40000))));

    TestApp {
        state,
        router,
        deployer,
        notifier,
    }
}

async fn app() -> TestApp {
    app_with(ServerConfig::default()).await
}

impl TestApp {
    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
        extra: &[(&str, &str)],
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> Reply {
        self.send(Method::GET, uri, token, None, &[]).await
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> Reply {
        self.send(Method::POST, uri, token, Some(body), &[]).await
    }

    async fn admin_post(&self, uri: &str, body: Value) -> Reply {
        let reply = self.post(uri, Some(ADMIN_TOKEN), body).await;
        assert!(
            reply.status.is_success(),
            "POST {uri} failed: {} {}",
            reply.status,
            reply.body
        );
        reply
    }

    async fn create_project(&self, name: &str) {
        self.admin_post("/api/admin/projects", json!({ "name": name }))
            .await;
    }

    async fn create_environment(&self, project: &str, name: &str, host: &str) {
        let deploy_key = ssh::generate_keypair("deploy").unwrap();
        let reply = self
            .admin_post(
                "/api/admin/environments",
                json!({
                    "project": project,
                    "name": name,
                    "host": host,
                    "deploy_user": "deploy",
                    "deploy_key": deploy_key.private_key.as_str(),
                }),
            )
            .await;
        assert!(reply.body.get("deploy_key").is_none());
    }

    /// Create a user through the admin API and return its session token.
    async fn create_user(&self, name: &str, role: &str, projects: &[&str]) -> String {
        let reply = self
            .admin_post(
                "/api/admin/users",
                json!({
                    "name": name,
                    "email": format!("{name}@example.com"),
                    "role": role,
                    "projects": projects,
                }),
            )
            .await;
        reply.body["token"].as_str().unwrap().to_owned()
    }
}

// ── Public surface ───────────────────────────────────────────────────

#[tokio::test]
async fn test_health_sets_security_headers() {
    let app = app().await;
    let reply = app.get("/health", None).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "ok");
    assert_eq!(reply.headers["x-content-type-options"], "nosniff");
    assert_eq!(reply.headers["x-frame-options"], "DENY");
    assert_eq!(reply.headers["referrer-policy"], "no-referrer");
    assert_eq!(reply.headers["cache-control"], "no-store");
    assert!(
        reply.headers["content-security-policy"]
            .to_str()
            .unwrap()
            .contains("default-src 'none'")
    );
    assert!(reply.headers.contains_key("permissions-policy"));
    assert!(!reply.headers.contains_key("strict-transport-security"));
}

#[tokio::test]
async fn test_hsts_only_with_tls() {
    let app = app_with(ServerConfig {
        tls_enabled: true,
        ..ServerConfig::default()
    })
    .await;
    let reply = app.get("/health", None).await;
    assert!(reply.headers.contains_key("strict-transport-security"));
}

// ── Invite and join ──────────────────────────────────────────────────

#[tokio::test]
async fn test_invite_join_end_to_end() {
    let app = app().await;
    app.create_project("shop").await;
    app.create_environment("shop", "prod", "prod.example").await;

    let invite = app
        .admin_post(
            "/api/admin/invites",
            json!({
                "username": "alice",
                "email": "alice@example.com",
                "role": "dev",
                "projects": ["shop"],
            }),
        )
        .await;
    assert_eq!(invite.status, StatusCode::CREATED);
    assert!(invite.body["invite"].get("token_hash").is_none());
    let invite_token = invite.body["token"].as_str().unwrap().to_owned();

    let joined = app
        .post("/api/join", None, json!({ "token": invite_token }))
        .await;
    assert_eq!(joined.status, StatusCode::CREATED, "{}", joined.body);
    assert_eq!(joined.body["username"], "alice");
    assert_eq!(joined.body["role"], "dev");
    assert!(
        joined.body["private_key"]
            .as_str()
            .unwrap()
            .contains("BEGIN OPENSSH PRIVATE KEY")
    );
    assert_eq!(joined.body["certificate"]["principals"], json!(["deploy"]));
    assert!(joined.body["ca_public_key"].is_string());

    let user = app.state.store.get_user("alice").await.unwrap();
    let public_key = user.public_key.as_deref().unwrap();
    assert!(public_key.starts_with("ssh-ed25519 "));
    ssh::parse_public_key(public_key).unwrap();
    assert_eq!(user.failed_login_count, 0);
    assert_eq!(user.projects, ["shop"]);
    assert!(user.cert_serial.is_some());

    // The session token from the join works immediately.
    let session = joined.body["token"].as_str().unwrap();
    let me = app.get("/api/me", Some(session)).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["name"], "alice");

    let reused = app
        .post("/api/join", None, json!({ "token": invite_token }))
        .await;
    assert_eq!(reused.status, StatusCode::UNAUTHORIZED);

    app.state.tasks.wait_idle().await;
    assert!(app.deployer.calls().contains(&"add prod.example alice".to_owned()));
    let events = app.notifier.events();
    assert!(events.contains(&"invited alice".to_owned()));
    assert!(events.contains(&"joined alice".to_owned()));
}

#[tokio::test]
async fn test_invite_for_existing_user_conflicts() {
    let app = app().await;
    app.create_user("bob", "dev", &[]).await;

    let reply = app
        .post(
            "/api/admin/invites",
            Some(ADMIN_TOKEN),
            json!({ "username": "bob", "email": "bob@example.com" }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_eq!(reply.body["error"], "conflict");
}

#[tokio::test]
async fn test_revoked_invite_cannot_join() {
    let app = app().await;
    let invite = app
        .admin_post(
            "/api/admin/invites",
            json!({ "username": "carol", "email": "carol@example.com" }),
        )
        .await;
    let id = invite.body["invite"]["id"].as_i64().unwrap();

    let pending = app.get("/api/admin/invites", Some(ADMIN_TOKEN)).await;
    assert_eq!(pending.body.as_array().unwrap().len(), 1);

    let revoked = app
        .send(
            Method::DELETE,
            &format!("/api/admin/invites/{id}"),
            Some(ADMIN_TOKEN),
            None,
            &[],
        )
        .await;
    assert_eq!(revoked.status, StatusCode::NO_CONTENT);

    let joined = app
        .post("/api/join", None, json!({ "token": invite.body["token"] }))
        .await;
    assert_eq!(joined.status, StatusCode::UNAUTHORIZED);
}

// ── Authentication and authorization ─────────────────────────────────

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = app().await;
    let reply = app.get("/api/me", None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"], "unauthorized");
}

#[tokio::test]
async fn test_dev_user_cannot_use_admin_routes() {
    let app = app().await;
    let token = app.create_user("dave", "dev", &[]).await;

    let reply = app.get("/api/admin/projects", Some(&token)).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.body["error"], "forbidden");

    let me = app.get("/api/me", Some(&token)).await;
    assert_eq!(me.status, StatusCode::OK);
}

#[tokio::test]
async fn test_expired_user_is_rejected() {
    let app = app().await;
    let reply = app
        .admin_post(
            "/api/admin/users",
            json!({
                "name": "erin",
                "email": "erin@example.com",
                "expires_at": "2001-01-01T00:00:00Z",
            }),
        )
        .await;
    let token = reply.body["token"].as_str().unwrap();

    let me = app.get("/api/me", Some(token)).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_lockout_after_repeated_bad_tokens() {
    let app = app_with(ServerConfig {
        lockout_max_attempts: 3,
        ..ServerConfig::default()
    })
    .await;

    for _ in 0..2 {
        let reply = app.get("/api/me", Some("not-a-token")).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }
    let third = app.get("/api/me", Some("not-a-token")).await;
    assert_eq!(third.status, StatusCode::FORBIDDEN);
    assert_eq!(third.body["error"], "locked_out");

    // Even a valid token is refused while locked out.
    let valid = app.get("/api/admin/users", Some(ADMIN_TOKEN)).await;
    assert_eq!(valid.status, StatusCode::FORBIDDEN);
    assert_eq!(valid.body["error"], "locked_out");

    app.state.tasks.wait_idle().await;
    assert!(
        app.notifier
            .events()
            .iter()
            .any(|e| e.starts_with("alert address locked out")),
        "lockout alert not sent: {:?}",
        app.notifier.events()
    );
}

#[tokio::test]
async fn test_rate_limit() {
    let app = app_with(ServerConfig {
        rate_limit: 3,
        ..ServerConfig::default()
    })
    .await;

    for _ in 0..3 {
        assert_eq!(app.get("/health", None).await.status, StatusCode::OK);
    }
    let limited = app.get("/health", None).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["error"], "rate_limited");
}

#[tokio::test]
async fn test_invalid_json_is_bad_request() {
    let app = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/admin/projects")
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bad_name = app
        .post(
            "/api/admin/projects",
            Some(ADMIN_TOKEN),
            json!({ "name": "has space" }),
        )
        .await;
    assert_eq!(bad_name.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_name.body["error"], "bad_request");
}

// ── MFA ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mfa_required_policy_for_admin_users() {
    let app = app_with(ServerConfig {
        mfa_policy: MfaPolicy::Required,
        ..ServerConfig::default()
    })
    .await;
    let token = app.create_user("root", "admin", &[]).await;

    let blocked = app.get("/api/admin/users", Some(&token)).await;
    assert_eq!(blocked.status, StatusCode::FORBIDDEN);
    assert_eq!(blocked.body["error"], "mfa_required");

    // The static admin token has no account and is exempt.
    let static_admin = app.get("/api/admin/users", Some(ADMIN_TOKEN)).await;
    assert_eq!(static_admin.status, StatusCode::OK);

    let setup = app.post("/api/mfa/setup", Some(&token), json!({})).await;
    assert_eq!(setup.status, StatusCode::OK, "{}", setup.body);
    let secret = setup.body["secret"].as_str().unwrap().to_owned();

    let wrong = app
        .post("/api/mfa/verify", Some(&token), json!({ "code": "000000" }))
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let code = app.state.mfa.current_code(&secret).unwrap();
    let enabled = app
        .post("/api/mfa/verify", Some(&token), json!({ "code": code }))
        .await;
    assert_eq!(enabled.status, StatusCode::OK, "{}", enabled.body);
    let recovery: Vec<String> = serde_json::from_value(enabled.body["recovery_codes"].clone()).unwrap();
    assert_eq!(recovery.len(), 10);

    let no_code = app.get("/api/admin/users", Some(&token)).await;
    assert_eq!(no_code.body["error"], "mfa_required");

    let code = app.state.mfa.current_code(&secret).unwrap();
    let with_code = app
        .send(
            Method::GET,
            "/api/admin/users",
            Some(&token),
            None,
            &[("x-mfa-code", code.as_str())],
        )
        .await;
    assert_eq!(with_code.status, StatusCode::OK);

    // A recovery code works once.
    let first = app
        .send(
            Method::GET,
            "/api/admin/users",
            Some(&token),
            None,
            &[("x-mfa-code", recovery[0].as_str())],
        )
        .await;
    assert_eq!(first.status, StatusCode::OK);
    let again = app
        .send(
            Method::GET,
            "/api/admin/users",
            Some(&token),
            None,
            &[("x-mfa-code", recovery[0].as_str())],
        )
        .await;
    assert_eq!(again.status, StatusCode::FORBIDDEN);

    let user = app.state.store.get_user("root").await.unwrap();
    assert_eq!(user.failed_login_count, 1);
}

async fn admin_with_code(app: &TestApp, token: &str, code: &str) -> Reply {
    app.send(
        Method::GET,
        "/api/admin/users",
        Some(token),
        None,
        &[("x-mfa-code", code)],
    )
    .await
}

/// Enable MFA for the token's user through the API and return the TOTP
/// secret.
async fn enroll_mfa(app: &TestApp, token: &str) -> String {
    let setup = app.post("/api/mfa/setup", Some(token), json!({})).await;
    assert_eq!(setup.status, StatusCode::OK, "{}", setup.body);
    let secret = setup.body["secret"].as_str().unwrap().to_owned();
    let code = app.state.mfa.current_code(&secret).unwrap();
    let enabled = app
        .post("/api/mfa/verify", Some(token), json!({ "code": code }))
        .await;
    assert_eq!(enabled.status, StatusCode::OK, "{}", enabled.body);
    secret
}

/// A six-digit code outside the current acceptance window.
fn wrong_code(app: &TestApp, secret: &str) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let window: Vec<String> = [now - 30, now, now + 30]
        .iter()
        .map(|t| app.state.mfa.code_at(secret, *t).unwrap())
        .collect();
    ["000000", "111111", "222222", "333333"]
        .into_iter()
        .find(|c| !window.iter().any(|w| w == c))
        .unwrap()
        .to_owned()
}

#[tokio::test]
async fn test_repeated_mfa_failures_lock_the_account() {
    let app = app_with(ServerConfig {
        mfa_policy: MfaPolicy::Required,
        lockout_max_attempts: 3,
        ..ServerConfig::default()
    })
    .await;
    let token = app.create_user("root", "admin", &[]).await;
    let secret = enroll_mfa(&app, &token).await;

    for _ in 0..2 {
        let reply = admin_with_code(&app, &token, &wrong_code(&app, &secret)).await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "mfa_required");
    }
    let third = admin_with_code(&app, &token, &wrong_code(&app, &secret)).await;
    assert_eq!(third.status, StatusCode::FORBIDDEN);
    assert_eq!(third.body["error"], "locked_out");

    // The right code no longer helps, on any MFA path.
    let code = app.state.mfa.current_code(&secret).unwrap();
    let valid = admin_with_code(&app, &token, &code).await;
    assert_eq!(valid.body["error"], "locked_out");

    let verify = app
        .post("/api/mfa/verify", Some(&token), json!({ "code": code }))
        .await;
    assert_eq!(verify.body["error"], "locked_out");

    let disable = app
        .send(
            Method::DELETE,
            "/api/mfa/setup",
            Some(&token),
            Some(json!({ "code": code })),
            &[],
        )
        .await;
    assert_eq!(disable.body["error"], "locked_out");
    assert!(app.state.store.get_user("root").await.unwrap().mfa_enabled);

    // The bearer token itself stays valid for non-MFA routes.
    assert_eq!(app.get("/api/me", Some(&token)).await.status, StatusCode::OK);

    let lockouts = app
        .get("/api/admin/audit?action=mfa.lockout", Some(ADMIN_TOKEN))
        .await;
    assert_eq!(lockouts.body.as_array().unwrap().len(), 1);

    app.state.tasks.wait_idle().await;
    assert!(
        app.notifier
            .events()
            .contains(&"alert account MFA locked out after 3".to_owned()),
        "MFA lockout alert not sent: {:?}",
        app.notifier.events()
    );
}

#[tokio::test]
async fn test_mfa_verify_endpoint_counts_failures() {
    let app = app_with(ServerConfig {
        lockout_max_attempts: 2,
        ..ServerConfig::default()
    })
    .await;
    let token = app.create_user("ivy", "dev", &[]).await;
    let secret = enroll_mfa(&app, &token).await;

    let first = app
        .post(
            "/api/mfa/verify",
            Some(&token),
            json!({ "code": wrong_code(&app, &secret) }),
        )
        .await;
    assert_eq!(first.status, StatusCode::UNAUTHORIZED);
    let second = app
        .post(
            "/api/mfa/verify",
            Some(&token),
            json!({ "code": wrong_code(&app, &secret) }),
        )
        .await;
    assert_eq!(second.body["error"], "locked_out");
}

// ── Sync ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_reports_per_environment() {
    let app = app().await;
    app.create_project("shop").await;
    app.create_environment("shop", "prod", "prod.example").await;
    app.create_environment("shop", "stage", UNREACHABLE_HOST).await;
    app.create_user("frank", "dev", &["shop"]).await;

    let reply = app
        .post("/api/admin/sync", Some(ADMIN_TOKEN), json!({}))
        .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.body["succeeded"], 1);
    assert_eq!(reply.body["failed"], 1);

    let results = reply.body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["environment"], "shop/prod");
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[0]["added"], 1);
    assert_eq!(results[1]["environment"], "shop/stage");
    assert_eq!(results[1]["success"], false);
    assert!(results[1]["error"].as_str().unwrap().contains("timed out"));

    let prod = app
        .get("/api/admin/environments/shop/prod", Some(ADMIN_TOKEN))
        .await;
    assert_eq!(prod.body["host_key_fingerprint"], FAKE_FINGERPRINT);

    let one = app
        .post(
            "/api/admin/sync",
            Some(ADMIN_TOKEN),
            json!({ "environment": "shop/prod" }),
        )
        .await;
    assert_eq!(one.body["results"].as_array().unwrap().len(), 1);

    let unknown = app
        .post(
            "/api/admin/sync",
            Some(ADMIN_TOKEN),
            json!({ "environment": "nope" }),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_revoke_access_removes_key_in_background() {
    let app = app().await;
    app.create_project("shop").await;
    app.create_environment("shop", "prod", "prod.example").await;
    app.create_user("gina", "dev", &["shop"]).await;

    let reply = app
        .send(
            Method::DELETE,
            "/api/admin/users/gina/access",
            Some(ADMIN_TOKEN),
            Some(json!({ "project": "shop" })),
            &[],
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.body["changed"], true);

    app.state.tasks.wait_idle().await;
    assert!(app.deployer.calls().contains(&"remove prod.example gina".to_owned()));
}

#[tokio::test]
async fn test_environment_connection_test() {
    let app = app().await;
    app.create_project("shop").await;
    app.create_environment("shop", "stage", UNREACHABLE_HOST).await;

    let reply = app
        .post(
            "/api/admin/environments/shop/stage/test",
            Some(ADMIN_TOKEN),
            json!({}),
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["success"], false);
    assert!(reply.body["error"].is_string());
}

// ── Audit ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_audit_query_and_verify() {
    let app = app().await;
    app.create_project("shop").await;
    app.create_project("blog").await;
    let _ = app.get("/api/me", Some("bogus")).await;

    let created = app
        .get("/api/admin/audit?action=project.created", Some(ADMIN_TOKEN))
        .await;
    assert_eq!(created.status, StatusCode::OK);
    let entries = created.body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e["user"] == "admin"));

    let failed = app
        .get("/api/admin/audit?action=auth.failed", Some(ADMIN_TOKEN))
        .await;
    assert_eq!(failed.body.as_array().unwrap().len(), 1);

    let verify = app.get("/api/admin/audit/verify", Some(ADMIN_TOKEN)).await;
    assert_eq!(verify.status, StatusCode::OK);
    assert_eq!(verify.body["valid"], true);
    assert!(verify.body["first_invalid_index"].is_null());

    let bad = app
        .get("/api/admin/audit?from=yesterday", Some(ADMIN_TOKEN))
        .await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_admin_mutations_are_audited() {
    let app = app().await;
    app.create_user("jack", "dev", &[]).await;

    let duplicate = app
        .post(
            "/api/admin/users",
            Some(ADMIN_TOKEN),
            json!({ "name": "jack", "email": "jack@example.com" }),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let missing = app
        .send(
            Method::DELETE,
            "/api/admin/projects/nope",
            Some(ADMIN_TOKEN),
            None,
            &[],
        )
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    // Reads that fail are not admin actions.
    let read = app.get("/api/admin/projects/nope", Some(ADMIN_TOKEN)).await;
    assert_eq!(read.status, StatusCode::NOT_FOUND);

    let failed = app
        .get("/api/admin/audit?action=admin.failed", Some(ADMIN_TOKEN))
        .await;
    let entries = failed.body.as_array().unwrap();
    assert_eq!(entries.len(), 2, "{}", failed.body);
    assert!(entries.iter().all(|e| e["user"] == "admin"));
    // Newest first.
    assert_eq!(entries[0]["details"], "DELETE /api/admin/projects/nope: not_found (404)");
    assert_eq!(entries[1]["details"], "POST /api/admin/users: conflict (409)");
}

#[tokio::test]
async fn test_authentication_outcomes_are_audited() {
    let app = app().await;
    let token = app.create_user("kate", "dev", &[]).await;
    assert_eq!(app.get("/api/me", Some(&token)).await.status, StatusCode::OK);

    let success = app
        .get("/api/admin/audit?action=auth.success&user=kate", Some(ADMIN_TOKEN))
        .await;
    let entries = success.body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["details"], "GET /api/me");

    // A forged username in a bad token does not become the actor.
    let forged = app.get("/api/me", Some("kate.not-the-secret")).await;
    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);

    let failed = app
        .get("/api/admin/audit?action=auth.failed", Some(ADMIN_TOKEN))
        .await;
    let entries = failed.body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["user"], "anonymous");
    assert!(entries[0]["details"].as_str().unwrap().contains("\"kate\""));

    let as_kate = app
        .get("/api/admin/audit?action=auth.failed&user=kate", Some(ADMIN_TOKEN))
        .await;
    assert!(as_kate.body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_ca_endpoint() {
    let app = app().await;
    let reply = app.get("/api/admin/ca", Some(ADMIN_TOKEN)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["enabled"], true);
    assert!(
        reply.body["fingerprint"]
            .as_str()
            .unwrap()
            .starts_with("SHA256:")
    );
}
