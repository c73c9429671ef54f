use crate::error::AppError;
use crate::market::types::{parse_history_payload, AuthToken, Candle, MarketSelection};
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const STREAM_PATH: &str = "/ws";
const KLINES_PATH: &str = "/api/v1/klines";
const DEV_FRONTEND_HOST: &str = "localhost:5173";
const DEV_BACKEND_HOST: &str = "localhost:8080";

pub type MarketWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Origin<'a> {
    secure: bool,
    host: &'a str,
}

fn parse_origin(origin: &str) -> Result<Origin<'_>, AppError> {
    let trimmed = origin.trim();
    let (secure, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(AppError::InvalidArgument(format!(
            "origin '{trimmed}' must use the http:// or https:// scheme"
        )));
    };

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "origin '{trimmed}' has no host"
        )));
    }

    Ok(Origin {
        secure,
        host: backend_host(host),
    })
}

// The dev frontend server does not proxy the stream; talk to the backend port directly.
fn backend_host(host: &str) -> &str {
    if host == DEV_FRONTEND_HOST {
        DEV_BACKEND_HOST
    } else {
        host
    }
}

pub fn ws_endpoint_for_origin(origin: &str) -> Result<String, AppError> {
    let origin = parse_origin(origin)?;
    let scheme = if origin.secure { "wss" } else { "ws" };
    Ok(format!("{scheme}://{}{STREAM_PATH}", origin.host))
}

pub fn http_base_for_origin(origin: &str) -> Result<String, AppError> {
    let origin = parse_origin(origin)?;
    let scheme = if origin.secure { "https" } else { "http" };
    Ok(format!("{scheme}://{}", origin.host))
}

fn klines_endpoint(base_url: &str, selection: &MarketSelection) -> String {
    format!(
        "{}{KLINES_PATH}/{}?period={}",
        base_url.trim_end_matches('/'),
        selection.symbol.to_ascii_uppercase(),
        selection.timeframe.as_str()
    )
}

fn bearer_header(token: &AuthToken) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(&format!("Bearer {}", token.expose())).map_err(|_| {
        AppError::InvalidArgument("auth token contains invalid header characters".to_string())
    })
}

pub async fn connect_market_stream(
    ws_url: &str,
    auth_token: Option<&AuthToken>,
) -> Result<MarketWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let mut request = ws_url.into_client_request()?;
    if let Some(token) = auth_token {
        request
            .headers_mut()
            .insert(AUTHORIZATION, bearer_header(token)?);
    }

    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_klines_history(
    client: &Client,
    base_url: &str,
    selection: &MarketSelection,
    auth_token: Option<&AuthToken>,
) -> Result<Vec<Candle>, AppError> {
    let endpoint = klines_endpoint(base_url, selection);
    let mut request = client.get(endpoint);
    if let Some(token) = auth_token {
        request = request.bearer_auth(token.expose());
    }

    let response = request.send().await?.error_for_status()?;
    let mut payload = response.bytes().await?.to_vec();
    parse_history_payload(&mut payload)
}
