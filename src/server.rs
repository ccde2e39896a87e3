use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use futures::TryStreamExt;
use serde_json::json;
use warp::http::header::{HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::ingest::NewPost;
use crate::model::Location;
use crate::search::SearchQuery;
use crate::storage::{Asset, DEFAULT_CONTENT_TYPE};
use crate::Around;

#[derive(Clone)]
struct HandlerState {
    app: Arc<Around>,
    identity_header: Arc<str>,
    request_timeout: Duration,
}

/// HTTP front for the ingestion and search paths.
pub struct AroundServer {
    app: Arc<Around>,
    config: ServerConfig,
}

impl AroundServer {
    pub fn new(app: Arc<Around>, config: ServerConfig) -> Self {
        Self { app, config }
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        let state = HandlerState {
            app: self.app.clone(),
            identity_header: Arc::from(self.config.identity_header.to_ascii_lowercase()),
            request_timeout: self.config.request_timeout,
        };

        // POST /post (multipart: message, lat, lon, image)
        // Path before method, so unknown paths stay 404 rather than 405
        let post = warp::path("post")
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::header::headers_cloned())
            .and(warp::multipart::form().max_length(self.config.max_upload_bytes))
            .and(with_state(state.clone()))
            .and_then(handle_post);

        // GET /search?lat=..&lon=..&range=..
        let search = warp::path("search")
            .and(warp::path::end())
            .and(warp::get())
            .and(warp::query::<HashMap<String, String>>())
            .and(with_state(state))
            .and_then(handle_search);

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| "OK");

        let cors = warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST"])
            .allow_headers(vec!["Content-Type", "Authorization"]);

        post.or(search)
            .unify()
            .or(health.map(|r: &'static str| r.into_response()))
            .unify()
            .with(cors)
            .recover(handle_rejection)
    }

    /// Serves until `shutdown` resolves.
    pub async fn run<S>(self, shutdown: S) -> std::result::Result<(), warp::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let (addr, server) = warp::serve(self.routes()).try_bind_with_graceful_shutdown(self.config.addr, shutdown)?;
        tracing::info!("listening on {}", addr);
        server.await;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }
}

fn with_state(state: HandlerState) -> impl Filter<Extract = (HandlerState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// --- HANDLERS ---

async fn handle_post(headers: HeaderMap, form: FormData, state: HandlerState) -> std::result::Result<Response, Infallible> {
    let author = match identity(&headers, &state.identity_header) {
        Some(author) => author,
        None => return Ok(error_reply(StatusCode::UNAUTHORIZED, "missing caller identity")),
    };

    let work = async {
        let post = read_post_form(form, author).await?;
        state.app.ingest.ingest(post).await
    };

    let resp = match tokio::time::timeout(state.request_timeout, work).await {
        Ok(Ok(_record)) => with_cors(StatusCode::OK.into_response()),
        Ok(Err(e)) => api_error(&e),
        Err(_) => deadline_exceeded(),
    };
    Ok(resp)
}

async fn handle_search(params: HashMap<String, String>, state: HandlerState) -> std::result::Result<Response, Infallible> {
    tracing::debug!("received search request");

    let query = match search_query(&params) {
        Ok(q) => q,
        Err(e) => return Ok(api_error(&e)),
    };

    let resp = match tokio::time::timeout(state.request_timeout, state.app.search.search(query)).await {
        Ok(Ok(results)) => json_body(results.body),
        Ok(Err(e)) => api_error(&e),
        Err(_) => deadline_exceeded(),
    };
    Ok(resp)
}

async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MethodNotAllowed>() {
        (StatusCode::METHOD_NOT_ALLOWED, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::UnsupportedMediaType>() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
    } else if let Some(e) = err.find::<warp::cors::CorsForbidden>() {
        (StatusCode::FORBIDDEN, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        tracing::warn!("unhandled rejection: {:?}", err);
        (StatusCode::BAD_REQUEST, "bad request".to_string())
    };
    Ok(error_reply(status, &message))
}

// --- REQUEST DECODING ---

fn identity(headers: &HeaderMap, header: &str) -> Option<String> {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_coord(name: &str, raw: Option<&str>) -> Result<f64> {
    let raw = raw.map(str::trim).filter(|v| !v.is_empty());
    let raw = raw.ok_or_else(|| Error::InvalidInput(format!("missing field {}", name)))?;
    raw.parse::<f64>()
        .map_err(|_| Error::InvalidInput(format!("{} is not a number: {:?}", name, raw)))
}

fn search_query(params: &HashMap<String, String>) -> Result<SearchQuery> {
    let lat = parse_coord("lat", params.get("lat").map(String::as_str))?;
    let lon = parse_coord("lon", params.get("lon").map(String::as_str))?;

    // Radius is optional; an empty value means the default
    let radius_km = match params.get("range").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => Some(
            raw.parse::<f64>()
                .map_err(|_| Error::InvalidInput(format!("range is not a number: {:?}", raw)))?,
        ),
        None => None,
    };

    Ok(SearchQuery { lat, lon, radius_km })
}

async fn read_part(part: Part) -> Result<Vec<u8>> {
    part.stream()
        .try_fold(Vec::new(), |mut acc, buf| async move {
            acc.put(buf);
            Ok(acc)
        })
        .await
        .map_err(|e| Error::InvalidInput(format!("unreadable form field: {}", e)))
}

fn utf8(name: &str, data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|_| Error::InvalidInput(format!("field {} is not valid UTF-8", name)))
}

async fn read_post_form(form: FormData, author: String) -> Result<NewPost> {
    let mut message = None;
    let mut lat = None;
    let mut lon = None;
    let mut asset = None;

    // Fields must be drained in order
    let mut form = Box::pin(form);
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| Error::InvalidInput(format!("malformed multipart body: {}", e)))?
    {
        let name = part.name().to_string();
        let content_type = part.content_type().unwrap_or(DEFAULT_CONTENT_TYPE).to_string();
        let data = read_part(part).await?;

        match name.as_str() {
            "message" => message = Some(utf8("message", data)?),
            "lat" => lat = Some(utf8("lat", data)?),
            "lon" => lon = Some(utf8("lon", data)?),
            "image" => asset = Some(Asset::new(data).with_content_type(content_type)),
            _ => {}
        }
    }

    let text = message.ok_or_else(|| Error::InvalidInput("missing field message".into()))?;
    let location = Location {
        lat: parse_coord("lat", lat.as_deref())?,
        lon: parse_coord("lon", lon.as_deref())?,
    };
    let asset = asset.ok_or_else(|| Error::InvalidInput("image is not available".into()))?;

    Ok(NewPost { author, text, location, asset })
}

// --- RESPONSES ---

fn with_cors(mut resp: Response) -> Response {
    resp.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    resp
}

fn json_body(body: Vec<u8>) -> Response {
    let mut resp = Response::new(body.into());
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    with_cors(resp)
}

fn error_reply(status: StatusCode, message: &str) -> Response {
    let body = json!({ "status": "error", "message": message });
    with_cors(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::AssetStore(_) | Error::Index(_) | Error::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::SearchUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn api_error(err: &Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!("request failed: {}", err);
    }
    error_reply(status, &err.to_string())
}

fn deadline_exceeded() -> Response {
    tracing::warn!("request deadline exceeded, in-flight calls cancelled");
    error_reply(StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn search_query_parsing() {
        let q = search_query(&params(&[("lat", "37.5"), ("lon", "-122"), ("range", "5")])).unwrap();
        assert_eq!(q, SearchQuery { lat: 37.5, lon: -122.0, radius_km: Some(5.0) });

        let q = search_query(&params(&[("lat", "1"), ("lon", "2"), ("range", "")])).unwrap();
        assert_eq!(q.radius_km, None);
    }

    #[test]
    fn search_query_requires_coordinates() {
        assert!(matches!(search_query(&params(&[("lon", "2")])), Err(Error::InvalidInput(_))));
        assert!(matches!(search_query(&params(&[("lat", "x"), ("lon", "2")])), Err(Error::InvalidInput(_))));
        assert!(matches!(
            search_query(&params(&[("lat", "1"), ("lon", "2"), ("range", "far")])),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn identity_header_lookup() {
        let mut headers = HeaderMap::new();
        assert_eq!(identity(&headers, "x-authenticated-user"), None);

        headers.insert("x-authenticated-user", HeaderValue::from_static("  "));
        assert_eq!(identity(&headers, "x-authenticated-user"), None);

        headers.insert("x-authenticated-user", HeaderValue::from_static("alice"));
        assert_eq!(identity(&headers, "x-authenticated-user"), Some("alice".to_string()));
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(status_for(&Error::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::AssetStore("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(&Error::Index("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(&Error::SearchUnavailable("x".into())), StatusCode::SERVICE_UNAVAILABLE);
    }
}
