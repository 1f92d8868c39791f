use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    AUTHORIZATION, CONTENT_TYPE, HeaderValue,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Method, Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::Value;
use std::{convert::Infallible, future::Future, io, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    GraphQLRequest,
    error::GatewayError,
    federation_gateway::{FederationGateway, error_response},
};

type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    respond(status, "application/json", body.to_string())
}

/// Routes one inbound HTTP request.
pub async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<Response<ResponseBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let body = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!(error = %e, "failed to read request body");
                    return Ok(respond(
                        StatusCode::BAD_REQUEST,
                        "text/plain",
                        "Failed to read request body",
                    ));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body) {
                Ok(request) => match gateway.authorize(authorization).await {
                    Ok(context) => {
                        let result = gateway.process_request(request, context).await;
                        json_response(StatusCode::OK, &result)
                    }
                    Err(err) => json_response(StatusCode::OK, &error_response(&err)),
                },
                Err(e) => json_response(
                    StatusCode::BAD_REQUEST,
                    &error_response(&GatewayError::InvalidQuery(format!(
                        "Invalid JSON request: {}",
                        e
                    ))),
                ),
            }
        }

        (&Method::GET, "/schema") => respond(StatusCode::OK, "text/plain; charset=utf-8", gateway.sdl()),

        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),

        (&Method::OPTIONS, _) => {
            let mut response = respond(StatusCode::NO_CONTENT, "text/plain", "");
            let headers = response.headers_mut();
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            );
            response
        }

        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}

/// Accepts connections until `shutdown` resolves, then closes the gateway's
/// service clients. Connections already accepted finish on their own tasks.
pub async fn serve<F>(
    listener: TcpListener,
    gateway: Arc<FederationGateway>,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    info!(address = %listener.local_addr()?, "gateway listening");
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = &mut shutdown => break,
        };
        let (stream, peer) = match accepted {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, gateway.clone()));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(peer = %peer, error = %e, "connection closed with error");
            }
        });
    }

    info!("no longer accepting connections");
    gateway.shutdown().await;
    Ok(())
}
