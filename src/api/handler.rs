//! REST routes over the management facade
//!
//! Every route except `/`, `/health`, `/ping` and `/auth/login` needs an
//! `Authorization: Bearer <token>` header. Errors come back as
//! `{"detail": "..."}` with the status of the underlying error.

use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::service::NewRule;
use super::ApiState;
use crate::error::{Result, VigilError};
use crate::models::{Permission, Protocol, User};
use crate::rules::RuleView;
use crate::storage::RequestQuery;

pub type ApiResponse = Response<Full<Bytes>>;

/// Largest page a request listing returns
const MAX_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct DomainBody {
    domain: String,
    #[serde(default)]
    public_ips: Vec<IpAddr>,
    owner: Option<String>,
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PublicIpsBody {
    public_ips: Vec<IpAddr>,
}

fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct ZoneBody {
    domain: String,
    #[serde(default = "one")]
    num: usize,
    /// Custom label for a single zone
    zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrantBody {
    username: String,
    permission: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct TokenBody {
    access_token: String,
    token_type: &'static str,
}

/// Entry point for every API request
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> std::result::Result<ApiResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match route(req, &state).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    };
    debug!("{} {} -> {}", method, path, response.status().as_u16());
    Ok(response)
}

async fn route(req: Request<Incoming>, state: &ApiState) -> Result<ApiResponse> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", []) => json(
            StatusCode::OK,
            &json!({
                "name": "vigil",
                "version": env!("CARGO_PKG_VERSION"),
                "api_host": state.api_host.as_ref().map(|u| u.as_str()),
            }),
        ),
        ("GET", ["health"]) => json(StatusCode::OK, &json!({ "status": "ok" })),
        ("GET", ["ping"]) => json(StatusCode::OK, &json!("pong")),
        ("POST", ["auth", "login"]) => login(req, state).await,
        _ => {
            let token = bearer_token(&req)?;
            let user = state.management.authenticate(&token)?;
            authed_route(req, state, &user, &token, &method, &segments).await
        }
    }
}

async fn authed_route(
    req: Request<Incoming>,
    state: &ApiState,
    user: &User,
    token: &str,
    method: &str,
    segments: &[&str],
) -> Result<ApiResponse> {
    let api = &state.management;
    match (method, segments) {
        ("POST", ["auth", "logout"]) => {
            api.logout(token)?;
            json(StatusCode::OK, &json!({ "detail": "logged out" }))
        }

        ("GET", ["domains"]) => json(StatusCode::OK, &api.get_domains(user)),
        ("POST", ["domains"]) => {
            let body: DomainBody = read_json(req, state.max_body).await?;
            let ips: BTreeSet<IpAddr> = body.public_ips.into_iter().collect();
            let domain =
                api.register_domain(user, &body.domain, ips, body.owner.as_deref(), &body.users)
                    .await?;
            json(StatusCode::CREATED, &domain)
        }
        ("PUT", ["domains", domain]) => {
            let body: PublicIpsBody = read_json(req, state.max_body).await?;
            let ips = body.public_ips.into_iter().collect();
            json(StatusCode::OK, &api.update_public_ips(user, domain, ips).await?)
        }
        ("DELETE", ["domains", domain]) => json(StatusCode::OK, &api.delete_domain(user, domain).await?),

        ("GET", ["zones"]) => json(StatusCode::OK, &api.get_zones(user)),
        ("POST", ["zones"]) => {
            let body: ZoneBody = read_json(req, state.max_body).await?;
            let zones = api
                .issue_zones(user, &body.domain, body.num, body.zone.as_deref())
                .await?;
            json(StatusCode::CREATED, &zones)
        }
        ("DELETE", ["zones", fqdn]) => json(StatusCode::OK, &api.delete_zone(user, fqdn).await?),
        ("GET", ["zones", fqdn, "users"]) => json(StatusCode::OK, &api.get_users(user, fqdn)?),
        ("POST", ["zones", fqdn, "users"]) => {
            let body: GrantBody = read_json(req, state.max_body).await?;
            let permission = parse_permission(&body.permission)?;
            api.add_user_to_zone(user, fqdn, &body.username, permission)
                .await?;
            json(StatusCode::OK, &api.get_users(user, fqdn)?)
        }
        ("DELETE", ["zones", fqdn, "users", target]) => {
            api.remove_user_from_zone(user, fqdn, target).await?;
            json(StatusCode::OK, &api.get_users(user, fqdn)?)
        }

        ("GET", ["users"]) => json(StatusCode::OK, &api.get_all_users(user)),

        ("GET", ["requests", zone]) => {
            let query = parse_request_query(req.uri().query().unwrap_or_default())?;
            json(StatusCode::OK, &api.get_requests(user, zone, &query).await?)
        }
        ("GET", ["requests", zone, time]) => {
            let time = parse_time(time)?;
            json(StatusCode::OK, &api.get_request(user, zone, time).await?)
        }

        ("GET", ["rules", zone]) => {
            let rules: Vec<RuleView> = api.get_rules(user, zone)?.iter().map(RuleView::from).collect();
            json(StatusCode::OK, &rules)
        }
        ("POST", ["rules", zone]) => {
            let body: NewRule = read_json(req, state.max_body).await?;
            let rule = api.add_rule(user, zone, &body).await?;
            json(StatusCode::CREATED, &RuleView::from(&rule))
        }
        ("DELETE", ["rules", zone, id]) => {
            let id = Uuid::parse_str(id)
                .map_err(|_| VigilError::MalformedInput(format!("'{id}' is not a rule id")))?;
            api.delete_rule(user, zone, id).await?;
            json(StatusCode::OK, &json!({ "detail": "deleted" }))
        }

        _ => Err(VigilError::NotFound(format!("route {method} /{}", segments.join("/")))),
    }
}

/// Accepts JSON or form-encoded credentials
async fn login(req: Request<Incoming>, state: &ApiState) -> Result<ApiResponse> {
    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    let bytes = read_body(req, state.max_body).await?;

    let body = if is_form {
        let mut username = None;
        let mut password = None;
        for (key, value) in url::form_urlencoded::parse(&bytes) {
            match key.as_ref() {
                "username" => username = Some(value.into_owned()),
                "password" => password = Some(value.into_owned()),
                _ => {}
            }
        }
        match (username, password) {
            (Some(username), Some(password)) => LoginBody { username, password },
            _ => {
                return Err(VigilError::MalformedInput(
                    "username and password are required".to_string(),
                ))
            }
        }
    } else {
        serde_json::from_slice(&bytes)?
    };

    let token = state
        .management
        .login(&body.username, &body.password)
        .await?;
    json(
        StatusCode::OK,
        &TokenBody {
            access_token: token,
            token_type: "bearer",
        },
    )
}

fn bearer_token(req: &Request<Incoming>) -> Result<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| VigilError::Unauthorized("Not authenticated".to_string()))
}

async fn read_body(req: Request<Incoming>, max: usize) -> Result<Bytes> {
    Limited::new(req.into_body(), max)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| VigilError::MalformedInput(format!("unreadable body: {e}")))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>, max: usize) -> Result<T> {
    let bytes = read_body(req, max).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Accepts a permission name ("READWRITE") or level (10)
fn parse_permission(value: &serde_json::Value) -> Result<Permission> {
    match value {
        serde_json::Value::String(s) => Permission::from_str(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|level| i32::try_from(level).ok())
            .and_then(Permission::from_level)
            .ok_or_else(|| VigilError::MalformedInput(format!("unknown permission level {n}"))),
        other => Err(VigilError::MalformedInput(format!(
            "permission must be a name or level, got {other}"
        ))),
    }
}

/// Capture times are addressed by epoch microseconds or RFC 3339
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(micros) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| VigilError::MalformedInput(format!("time {raw} out of range")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| VigilError::MalformedInput(format!("'{raw}' is not a valid time")))
}

/// Parses `protocols`, `skip`, `limit`, `from`, `to` and `order`
pub fn parse_request_query(raw: &str) -> Result<RequestQuery> {
    let mut query = RequestQuery::default();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "protocols" | "protocol" => {
                for name in value.split(',').filter(|s| !s.trim().is_empty()) {
                    let protocol = Protocol::from_str(name.trim())?;
                    if !query.protocols.contains(&protocol) {
                        query.protocols.push(protocol);
                    }
                }
            }
            "skip" => query.skip = parse_number(&key, &value)?,
            "limit" => query.limit = parse_number::<usize>(&key, &value)?.min(MAX_PAGE),
            "from" => query.from = Some(parse_time(&value)?),
            "to" => query.to = Some(parse_time(&value)?),
            "order" => {
                query.newest_first = match value.to_ascii_lowercase().as_str() {
                    "asc" => false,
                    "desc" => true,
                    other => {
                        return Err(VigilError::MalformedInput(format!(
                            "order must be asc or desc, got '{other}'"
                        )))
                    }
                }
            }
            _ => {}
        }
    }
    Ok(query)
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| VigilError::MalformedInput(format!("{key} must be a number")))
}

fn json<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Result<ApiResponse> {
    let bytes = serde_json::to_vec(body)?;
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// Maps an error to its status with a `{"detail"}` body
pub fn error_response(error: &VigilError) -> ApiResponse {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(&json!({ "detail": error.to_string() })).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if status == StatusCode::UNAUTHORIZED {
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    response
}
