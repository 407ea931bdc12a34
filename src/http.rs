/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/http.rs
*
* JSON-over-HTTP transport for the core's RPC methods. Every method is a
* `POST /v1/<method>` whose body and response are the request and response
* types of `server`. The caller's identity is read from the headers set by
* the authenticating proxy in front of this service.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clusters::Principal;
use crate::error::{Error, Result};
use crate::server::CoreServer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};
use warp::http::{HeaderMap, StatusCode};
use warp::Filter;

pub const REMOTE_USER_HEADER: &str = "x-remote-user";
pub const REMOTE_GROUP_HEADER: &str = "x-remote-group";

const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Injects the shared server into warp filters.
fn with_server(
    server: Arc<CoreServer>,
) -> impl Filter<Extract = (Arc<CoreServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

pub fn routes(
    server: Arc<CoreServer>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    let rpc = warp::post()
        .and(warp::path("v1"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::header::headers_cloned())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<Value>())
        .and(with_server(server))
        .and_then(handle_rpc);

    healthz.or(rpc)
}

/// The principal named by the proxy headers. Groups may be repeated
/// headers, comma-separated values, or both.
pub fn principal_from(headers: &HeaderMap) -> Option<Principal> {
    let user = headers
        .get(REMOTE_USER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .to_string();
    if user.is_empty() {
        return None;
    }
    let groups = headers
        .get_all(REMOTE_GROUP_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(str::to_string)
        .collect();
    Some(Principal::new(user, groups))
}

async fn handle_rpc(
    method: String,
    headers: HeaderMap,
    body: Value,
    server: Arc<CoreServer>,
) -> std::result::Result<warp::reply::WithStatus<warp::reply::Json>, warp::Rejection> {
    let Some(principal) = principal_from(&headers) else {
        let err = Error::PermissionDenied(format!("missing {} header", REMOTE_USER_HEADER));
        return Ok(render_error(StatusCode::UNAUTHORIZED, &err));
    };

    debug!(method = %method, principal = %principal.id, "rpc call");
    match dispatch(&server, &principal, &method, body).await {
        Ok(response) => Ok(warp::reply::with_status(
            warp::reply::json(&response),
            StatusCode::OK,
        )),
        Err(e) => {
            warn!(method = %method, principal = %principal.id, error = %e, "rpc failed");
            Ok(render_error(status_of(&e), &e))
        }
    }
}

async fn dispatch(
    server: &CoreServer,
    principal: &Principal,
    method: &str,
    body: Value,
) -> Result<Value> {
    match method {
        "list_objects" => respond(server.list_objects(principal, parse(body)?).await?),
        "get_object" => respond(server.get_object(principal, parse(body)?).await?),
        "sync" => respond(server.sync(principal, parse(body)?).await?),
        "suspend" => respond(server.suspend(principal, parse(body)?).await?),
        "get_inventory" => respond(server.get_inventory(principal, parse(body)?).await?),
        "list_policy_validations" => {
            respond(server.list_policy_validations(principal, parse(body)?).await?)
        }
        "get_policy_validation" => {
            respond(server.get_policy_validation(principal, parse(body)?).await?)
        }
        "get_session_logs" => respond(server.get_session_logs(principal, parse(body)?).await?),
        "is_crd_available" => respond(server.is_crd_available(parse(body)?).await?),
        other => Err(Error::NotFound(format!("unknown method {}", other))),
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| Error::InvalidArgument(format!("malformed request: {}", e)))
}

fn respond<T: Serialize>(response: T) -> Result<Value> {
    Ok(serde_json::to_value(response)?)
}

pub fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        // A batch whose failures all share one kind reports that kind.
        Error::Multi(multi) => {
            let mut statuses = multi.errors.iter().map(status_of);
            match statuses.next() {
                Some(first) if statuses.all(|s| s == first) => first,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
    }
}

fn error_body(err: &Error) -> Value {
    let mut body = json!({"kind": err.kind(), "message": err.to_string()});
    if let Error::Multi(multi) = err {
        body["errors"] = multi.errors.iter().map(error_body).collect();
    }
    body
}

fn render_error(status: StatusCode, err: &Error) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&error_body(err)), status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::namespace_cache::NamespaceCache;
    use crate::primary_kinds::PrimaryKinds;
    use crate::session_logs::S3Provider;
    use crate::testutil::{fleet, kustomization, namespace, FakeKube};
    use std::time::Duration;
    use warp::http::HeaderValue;

    async fn api(kube: FakeKube) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let (registry, _) = fleet(&[("Default", kube)]).await;
        let cache = Arc::new(NamespaceCache::new(registry.clone(), Duration::from_secs(300)));
        cache.refresh_all().await;
        let server = CoreServer::new(
            &CoreConfig::default(),
            registry,
            cache,
            Arc::new(PrimaryKinds::with_flux_kinds().unwrap()),
            Arc::new(S3Provider::new("us-east-1")),
        );
        routes(Arc::new(server))
    }

    fn body(raw: &[u8]) -> Value {
        serde_json::from_slice(raw).unwrap()
    }

    #[test]
    fn test_principal_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(principal_from(&headers).is_none());

        headers.insert(REMOTE_USER_HEADER, HeaderValue::from_static("anne"));
        headers.append(REMOTE_GROUP_HEADER, HeaderValue::from_static("devs, ops"));
        headers.append(REMOTE_GROUP_HEADER, HeaderValue::from_static("admins"));
        let principal = principal_from(&headers).unwrap();
        assert_eq!(principal.id, "anne");
        assert_eq!(principal.groups, vec!["devs", "ops", "admins"]);
    }

    #[tokio::test]
    async fn test_healthz() {
        let api = api(FakeKube::new()).await;
        let res = warp::test::request().path("/healthz").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_objects_over_http() {
        let kube = FakeKube::new();
        kube.insert(namespace("ns1", json!({})));
        kube.insert(kustomization("ns1", "ks1"));
        let api = api(kube).await;

        let res = warp::test::request()
            .method("POST")
            .path("/v1/list_objects")
            .header(REMOTE_USER_HEADER, "anne")
            .json(&json!({"kind": "Kustomization"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = body(res.body());
        assert_eq!(body["objects"].as_array().unwrap().len(), 1);
        assert_eq!(body["objects"][0]["cluster_name"], "Default");
        assert_eq!(body["next_page_token"], "");
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let api = api(FakeKube::new()).await;
        let res = warp::test::request()
            .method("POST")
            .path("/v1/list_objects")
            .json(&json!({"kind": "Kustomization"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(res.body())["kind"], "permission_denied");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let api = api(FakeKube::new()).await;
        let call = |path: &'static str, payload: Value| {
            warp::test::request()
                .method("POST")
                .path(path)
                .header(REMOTE_USER_HEADER, "anne")
                .json(&payload)
        };

        let res = call("/v1/nope", json!({})).reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = call("/v1/get_object", json!({"kind": 7})).reply(&api).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = call("/v1/list_objects", json!({"kind": "Widget"})).reply(&api).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let target = |name: &str| json!({"cluster": "Default", "kind": "Kustomization", "name": name, "namespace": "ns1"});
        let res = call("/v1/sync", json!({"objects": [target("a"), target("b")]}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = body(res.body());
        assert_eq!(body["kind"], "multi");
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_mixed_batch_is_internal() {
        let mut multi = crate::error::MultiError::default();
        multi.push(Error::NotFound("a".into()));
        multi.push(Error::Timeout("b".into()));
        assert_eq!(status_of(&Error::Multi(multi)), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
