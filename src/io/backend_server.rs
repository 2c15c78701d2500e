//! HTTP front for a `TicketBackend`
//!
//! Serves the same contract `HttpTicketBackend` consumes, so the engine can be
//! exercised end to end against the in-memory store.
//!
//! Error bodies are `{"code": .., "message": ..}`. A duplicate check-in is a
//! 409 with code `23505`; a refused ticket keeps the backend's status code.

use crate::domain::errors::{BackendError, InsertError};
use crate::domain::types::{EventId, OperatorId, TicketId};
use crate::services::ticket_backend::TicketBackend;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Deserialize)]
struct ResolveBody {
    code: String,
    operator_id: OperatorId,
}

#[derive(Deserialize)]
struct InsertBody {
    ticket_id: TicketId,
    #[serde(default)]
    event_id: Option<EventId>,
    operator_id: OperatorId,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(status, &ErrorBody { code, message: message.into() })
}

fn backend_failure(err: BackendError) -> Response<Full<Bytes>> {
    match err {
        BackendError::Status { status, body } => error_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "backend_status",
            body,
        ),
        other => error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", other.to_string()),
    }
}

fn code_param(req: &Request<hyper::body::Incoming>) -> Option<String> {
    let query = req.uri().query()?;
    let url = reqwest::Url::parse(&format!("http://localhost/?{query}")).ok()?;
    url.query_pairs().find(|(k, _)| k == "code").map(|(_, v)| v.into_owned())
}

async fn read_body<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    backend: Arc<dyn TicketBackend>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(method = %method, path = %path, "backend_request");

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/rpc/resolve_and_check_in") => {
            match read_body::<ResolveBody>(req).await {
                Ok(body) => match backend.resolve_and_check_in(&body.code, &body.operator_id).await {
                    Ok(result) => json_response(StatusCode::OK, &result),
                    Err(e) => backend_failure(e),
                },
                Err(response) => response,
            }
        }
        (&Method::GET, "/tickets/joined") => match code_param(&req) {
            Some(code) => match backend.find_ticket_by_code_joined(&code).await {
                Ok(Some(row)) => json_response(StatusCode::OK, &row),
                Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", "no row"),
                Err(e) => backend_failure(e),
            },
            None => error_response(StatusCode::BAD_REQUEST, "bad_request", "missing code"),
        },
        (&Method::GET, "/holders/by-code") => match code_param(&req) {
            Some(code) => match backend.find_holder_by_code(&code).await {
                Ok(Some(row)) => json_response(StatusCode::OK, &row),
                Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", "no row"),
                Err(e) => backend_failure(e),
            },
            None => error_response(StatusCode::BAD_REQUEST, "bad_request", "missing code"),
        },
        (&Method::POST, "/check_ins") => match read_body::<InsertBody>(req).await {
            Ok(body) => match backend
                .insert_check_in_record(&body.ticket_id, body.event_id.as_ref(), &body.operator_id)
                .await
            {
                Ok(()) => json_response(StatusCode::CREATED, &serde_json::json!({"ok": true})),
                Err(InsertError::Duplicate(e)) => {
                    error_response(StatusCode::CONFLICT, "23505", e.to_string())
                }
                Err(InsertError::Backend(e)) => backend_failure(e),
            },
            Err(response) => response,
        },
        (&Method::GET, "/health") => json_response(StatusCode::OK, &serde_json::json!({"ok": true})),
        _ => error_response(StatusCode::NOT_FOUND, "not_found", "no such route"),
    };

    Ok(response)
}

/// Serve `backend` on `listener` until `shutdown` flips to true
pub async fn serve(
    listener: TcpListener,
    backend: Arc<dyn TicketBackend>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(addr = %listener.local_addr()?, "backend_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let backend = backend.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let backend = backend.clone();
                                async move { handle_request(req, backend).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "backend_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "backend_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("backend_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
