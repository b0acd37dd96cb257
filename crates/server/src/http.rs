//! HTTP frontend.
//!
//! A small hand-rolled router over hyper: point get/set/delete under
//! `/key/{key}`, membership joins under `/join`, and a `/status` view of
//! the node's role and leader. Core errors map onto status codes; a
//! `NotLeader` rejection carries the leader's address so clients can
//! redirect themselves.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tessera_common::{Error, NodeId};
use tessera_kv::{Cluster, ReplicatedStore};
use tessera_raft::{Engine, RaftHandle};

/// Shared state behind every request handler.
pub struct AppState {
    pub node_id: NodeId,
    pub store: ReplicatedStore<RaftHandle>,
    pub cluster: Cluster<RaftHandle>,
    pub handle: RaftHandle,
}

/// Body of a `POST /join` request.
#[derive(Debug, Deserialize)]
struct JoinRequest {
    id: NodeId,
    address: String,
}

/// Accept connections until the shutdown signal flips.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind http listener on {addr}"))?;
    info!(%addr, "http frontend listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| route(req, state.clone()));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%remote, error = %e, "connection closed with error");
                    }
                });
            }
        }
    }
    info!("http frontend stopped");
    Ok(())
}

async fn route(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "routing request");

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => status(&state),
        (Method::POST, "/join") => join(req, &state).await,
        (method, path) if path.starts_with("/key/") => {
            let key = path["/key/".len()..].to_string();
            if key.is_empty() {
                json_error(StatusCode::BAD_REQUEST, "empty key", None)
            } else {
                match method {
                    Method::GET => get_key(&state, &key),
                    Method::POST => set_key(req, &state, &key).await,
                    Method::DELETE => delete_key(&state, &key).await,
                    _ => json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed", None),
                }
            }
        }
        _ => json_error(StatusCode::NOT_FOUND, "no such route", None),
    };
    Ok(response)
}

fn status(state: &AppState) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "state": state.handle.role().as_str(),
        "leader": state.handle.leader(),
        "node_id": state.node_id,
    });
    json_response(StatusCode::OK, &body)
}

fn get_key(state: &AppState, key: &str) -> Response<Full<Bytes>> {
    match state.store.get(key) {
        Ok(value) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(value)))
            .expect("static response"),
        Err(e) => error_response(&e),
    }
}

async fn set_key(
    req: Request<Incoming>,
    state: &AppState,
    key: &str,
) -> Response<Full<Bytes>> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let value = match String::from_utf8(body.to_vec()) {
        Ok(value) => value,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "value is not valid utf-8", None),
    };
    match state.store.set(key, &value).await {
        Ok(()) => empty(StatusCode::NO_CONTENT),
        Err(e) => error_response(&e),
    }
}

async fn delete_key(state: &AppState, key: &str) -> Response<Full<Bytes>> {
    match state.store.delete(key).await {
        Ok(()) => empty(StatusCode::NO_CONTENT),
        Err(e) => error_response(&e),
    }
}

async fn join(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let join: JoinRequest = match serde_json::from_slice(&body) {
        Ok(join) => join,
        Err(e) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid join request: {e}"),
                None,
            )
        }
    };
    match state.cluster.join(join.id, &join.address).await {
        Ok(()) => empty(StatusCode::NO_CONTENT),
        Err(e) => error_response(&e),
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &format!("bad request body: {e}"), None))
}

/// Map a core error onto a response.
fn error_response(err: &Error) -> Response<Full<Bytes>> {
    match err {
        Error::NotFound => json_error(StatusCode::NOT_FOUND, "key not found", None),
        Error::NotLeader { leader } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not leader",
            leader.as_ref().map(|(_, address)| address.as_str()),
        ),
        Error::Timeout => json_error(StatusCode::GATEWAY_TIMEOUT, "commit timed out", None),
        Error::Transport(_) => json_error(StatusCode::BAD_GATEWAY, &err.to_string(), None),
        Error::Shutdown => json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting down", None),
        Error::Storage(_) | Error::Encoding(_) | Error::Malformed(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string(), None)
        }
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response")
}

fn json_error(status: StatusCode, message: &str, leader: Option<&str>) -> Response<Full<Bytes>> {
    let body = match leader {
        Some(address) => serde_json::json!({ "error": message, "leader": address }),
        None => serde_json::json!({ "error": message }),
    };
    json_response(status, &body)
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_response_carries_the_leader_address() {
        let err = Error::NotLeader {
            leader: Some((2, "10.0.0.2:12000".to_string())),
        };
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(&Error::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(&Error::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_response(&Error::Storage("io".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_response(&Error::Transport("refused".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
