//! Loopback HTTP endpoint that receives the provider redirect.
//!
//! `GET /auth/callback?code=..&state=..` stages the pair in the [`CodeSlot`]
//! and answers with a page the user can close. Anything else gets a 404.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::delivery::CodeSlot;

pub const CALLBACK_PATH: &str = "/auth/callback";

const READ_TIMEOUT: Duration = Duration::from_secs(10);

const SUCCESS_HTML: &str = "<html><body><h2>Login successful!</h2>\
    <p>You can close this window and return to cmsdesk.</p></body></html>";

#[derive(Debug, Default, PartialEq, Eq)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

fn parse_query(query: &str) -> CallbackParams {
    let mut params = CallbackParams::default();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        match k.as_ref() {
            "code" => params.code = Some(v.into_owned()),
            "state" => params.state = Some(v.into_owned()),
            "error" => params.error = Some(v.into_owned()),
            "error_description" => params.error_description = Some(v.into_owned()),
            _ => {}
        }
    }
    params
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Handle to the running listener. Dropping it does not stop the server; call [`CallbackServer::shutdown`].
#[derive(Debug)]
pub struct CallbackServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl CallbackServer {
    /// Binds `host:port` (port 0 picks an ephemeral port) and starts serving.
    pub async fn bind(host: &str, port: u16, slot: Arc<CodeSlot>) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        tracing::info!(%addr, "OAuth callback listener started");
        tokio::spawn(serve(listener, slot, shutdown.clone()));

        Ok(Self { addr, shutdown })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Redirect URI derived from the bound port. Sent verbatim on both the
    /// authorize and token requests.
    pub fn redirect_uri(&self) -> String {
        let host = match self.addr.ip() {
            std::net::IpAddr::V6(ip) => format!("[{ip}]"),
            std::net::IpAddr::V4(ip) => ip.to_string(),
        };
        format!("http://{host}:{}{CALLBACK_PATH}", self.addr.port())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn serve(listener: TcpListener, slot: Arc<CodeSlot>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                tracing::debug!("accept error: {e}");
                continue;
            }
        };

        let slot = Arc::clone(&slot);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &slot).await {
                tracing::debug!("callback connection error: {e}");
            }
        });
    }
    tracing::info!("OAuth callback listener stopped");
}

async fn handle_connection(mut stream: TcpStream, slot: &CodeSlot) -> std::io::Result<()> {
    let mut buf = vec![0u8; 8192];
    let n = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(read) => read?,
        Err(_) => return Ok(()),
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let mut request_line = request
        .lines()
        .next()
        .unwrap_or("")
        .split_whitespace();
    let method = request_line.next().unwrap_or("");
    let target = request_line.next().unwrap_or("");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let response = if method != "GET" || path != CALLBACK_PATH {
        http_response("404 Not Found", "text/plain", "Not found")
    } else {
        let html = stage_callback(parse_query(query), slot);
        http_response("200 OK", "text/html; charset=utf-8", &html)
    };

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn stage_callback(params: CallbackParams, slot: &CodeSlot) -> String {
    if let Some(error) = params.error {
        let detail = params.error_description.unwrap_or_else(|| error.clone());
        tracing::warn!(%error, "Authorization server redirected with an error");
        return format!(
            "<html><body><h2>Login failed</h2><p>{}</p></body></html>",
            html_escape(&detail)
        );
    }

    match (params.code, params.state) {
        (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => {
            slot.deliver(code, state);
            SUCCESS_HTML.to_string()
        }
        _ => {
            tracing::warn!("Callback without code or state");
            "<html><body><h2>Login failed</h2>\
             <p>No authorization code received.</p></body></html>"
                .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(url: &str) -> (u16, String) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    #[test]
    fn query_is_percent_decoded() {
        let params = parse_query("code=a%2Fb%3D&state=xyz&session_state=ignored");
        assert_eq!(params.code.as_deref(), Some("a/b="));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(params.error.is_none());
    }

    #[test]
    fn error_page_escapes_description() {
        let slot = CodeSlot::new();
        let html = stage_callback(
            parse_query("error=access_denied&error_description=%3Cscript%3E"),
            &slot,
        );
        assert!(html.contains("&lt;script&gt;"));
        assert!(slot.poll().is_none());
    }

    #[tokio::test]
    async fn callback_stages_code() {
        let slot = Arc::new(CodeSlot::new());
        let server = CallbackServer::bind("127.0.0.1", 0, Arc::clone(&slot))
            .await
            .unwrap();

        let url = format!("{}?code=abc&state=st-1", server.redirect_uri());
        let (status, body) = get(&url).await;
        assert_eq!(status, 200);
        assert!(body.contains("Login successful"));

        let delivered = slot.poll().unwrap();
        assert_eq!(delivered.code, "abc");
        assert_eq!(delivered.state, "st-1");
        server.shutdown();
    }

    #[tokio::test]
    async fn missing_code_stages_nothing() {
        let slot = Arc::new(CodeSlot::new());
        let server = CallbackServer::bind("127.0.0.1", 0, Arc::clone(&slot))
            .await
            .unwrap();

        let (status, body) = get(&format!("{}?state=only", server.redirect_uri())).await;
        assert_eq!(status, 200);
        assert!(body.contains("Login failed"));
        assert!(slot.poll().is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let slot = Arc::new(CodeSlot::new());
        let server = CallbackServer::bind("127.0.0.1", 0, Arc::clone(&slot))
            .await
            .unwrap();

        let (status, _) = get(&format!("http://{}/favicon.ico", server.local_addr())).await;
        assert_eq!(status, 404);
        server.shutdown();
    }

    #[tokio::test]
    async fn redirect_uri_uses_bound_port() {
        let server = CallbackServer::bind("127.0.0.1", 0, Arc::new(CodeSlot::new()))
            .await
            .unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(
            server.redirect_uri(),
            format!("http://127.0.0.1:{port}/auth/callback")
        );
        server.shutdown();
    }
}
