//! Interactive authorization strategies.
//!
//! With a desktop session the consent page is opened in a browser and the
//! code comes back to a one-shot listener on 127.0.0.1. On a headless host
//! the URL is printed and the user pastes back the code (or the whole
//! redirect URL).

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{OAuthClient, PkceChallenge, TokenResponse};
use crate::config::{AuthConfig, AuthFlowKind};
use crate::error::AuthError;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// How long one connection may take to send its request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CALLBACK_PATH: &str = "/callback";

#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authorize(&self, oauth: &OAuthClient) -> Result<TokenResponse, AuthError>;
}

/// Pick a flow from the configured preference, detecting a browser for `auto`.
pub fn select_flow(config: &AuthConfig) -> Box<dyn AuthorizationFlow> {
    let loopback = match config.flow {
        AuthFlowKind::Loopback => true,
        AuthFlowKind::Manual => false,
        AuthFlowKind::Auto => browser_available(|key| std::env::var_os(key).is_some()),
    };

    if loopback {
        Box::new(LoopbackFlow::default())
    } else {
        Box::new(ManualCodeFlow::new(config.manual_redirect_uri.clone()))
    }
}

/// Whether an interactive browser session is likely reachable.
fn browser_available(is_set: impl Fn(&str) -> bool) -> bool {
    if is_set("SSH_CONNECTION") || is_set("SSH_TTY") {
        return false;
    }
    if is_set("BROWSER") {
        return true;
    }
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        return true;
    }
    is_set("DISPLAY") || is_set("WAYLAND_DISPLAY")
}

/// Browser consent with a local redirect listener.
pub struct LoopbackFlow {
    timeout: Duration,
    request_timeout: Duration,
}

impl Default for LoopbackFlow {
    fn default() -> Self {
        Self {
            timeout: CALLBACK_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

#[async_trait]
impl AuthorizationFlow for LoopbackFlow {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn authorize(&self, oauth: &OAuthClient) -> Result<TokenResponse, AuthError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{}{}", port, CALLBACK_PATH);

        let pkce = PkceChallenge::generate();
        let auth_url = oauth.authorize_url(&redirect_uri, &pkce)?;

        println!("Open this URL to authorize Google Drive access:\n\n{auth_url}\n");
        if let Err(e) = open_in_browser(&auth_url) {
            warn!(error = %e, "Could not open a browser");
        }

        let code =
            wait_for_code(listener, &pkce.state, self.timeout, self.request_timeout).await?;
        debug!("Received authorization code");
        oauth
            .exchange_code(&code, &redirect_uri, &pkce.verifier)
            .await
    }
}

fn open_in_browser(url: &str) -> std::io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/C", "start", ""]);
        cmd
    } else {
        std::process::Command::new("xdg-open")
    };

    command
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
}

/// Wait on `listener` for the redirect and pull the code out of its query.
/// `timeout` bounds the whole wait, including connections that never
/// send anything.
async fn wait_for_code(
    listener: TcpListener,
    expected_state: &str,
    timeout: Duration,
    request_timeout: Duration,
) -> Result<String, AuthError> {
    tokio::time::timeout(
        timeout,
        accept_callback(&listener, expected_state, request_timeout),
    )
    .await
    .map_err(|_| AuthError::Timeout)?
}

/// Serve connections until one carries the callback request. Browsers open
/// speculative connections and ask for `/favicon.ico`; those are skipped.
async fn accept_callback(
    listener: &TcpListener,
    expected_state: &str,
    request_timeout: Duration,
) -> Result<String, AuthError> {
    loop {
        let (mut socket, addr) = listener.accept().await?;

        let target =
            match tokio::time::timeout(request_timeout, read_request_target(&mut socket)).await {
                Ok(Ok(target)) => target,
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "Ignoring unreadable connection");
                    continue;
                }
                Err(_) => {
                    debug!(%addr, "Ignoring idle connection");
                    continue;
                }
            };

        let url = match Url::parse(&format!("http://localhost{}", target)) {
            Ok(url) if url.path() == CALLBACK_PATH => url,
            _ => {
                debug!(%addr, target = %target, "Ignoring request outside the callback path");
                let _ = write_response(&mut socket, "404 Not Found", "Not found").await;
                continue;
            }
        };

        debug!(%addr, "Authorization redirect received");
        let result = code_from_query(&url, Some(expected_state));
        respond_to_browser(&mut socket, result.is_ok()).await?;
        return result;
    }
}

async fn read_request_target(socket: &mut TcpStream) -> Result<String, AuthError> {
    let mut buffer = vec![0u8; 4096];
    let read = socket.read(&mut buffer).await?;
    if read == 0 {
        return Err(AuthError::Callback("empty redirect request".into()));
    }

    let request = String::from_utf8_lossy(&buffer[..read]);
    request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(String::from)
        .ok_or_else(|| AuthError::Callback("malformed redirect request".into()))
}

async fn respond_to_browser(socket: &mut TcpStream, success: bool) -> Result<(), AuthError> {
    let body = if success {
        "Authorization complete. You can close this window."
    } else {
        "Authorization failed. Return to the terminal for details."
    };
    write_response(socket, "200 OK", body).await
}

async fn write_response(socket: &mut TcpStream, status: &str, body: &str) -> Result<(), AuthError> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Extract `code` from a redirect URL, checking `state` when one is expected.
fn code_from_query(url: &Url, expected_state: Option<&str>) -> Result<String, AuthError> {
    let mut code = None;
    let mut state = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(AuthError::Callback(value.into_owned())),
            _ => {}
        }
    }

    if let Some(expected) = expected_state {
        if state.as_deref() != Some(expected) {
            return Err(AuthError::StateMismatch);
        }
    }

    code.ok_or_else(|| AuthError::Callback("redirect is missing the authorization code".into()))
}

/// Consent in any browser, code pasted back on stdin.
pub struct ManualCodeFlow {
    redirect_uri: String,
}

impl ManualCodeFlow {
    pub fn new(redirect_uri: String) -> Self {
        Self { redirect_uri }
    }
}

#[async_trait]
impl AuthorizationFlow for ManualCodeFlow {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn authorize(&self, oauth: &OAuthClient) -> Result<TokenResponse, AuthError> {
        let pkce = PkceChallenge::generate();
        let auth_url = oauth.authorize_url(&self.redirect_uri, &pkce)?;

        println!("Open this URL in any browser to authorize Google Drive access:\n\n{auth_url}\n");
        println!(
            "After approving, the browser is sent to {}. Paste that full address (or just the code) here:",
            self.redirect_uri
        );

        let input = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| AuthError::Callback(e.to_string()))??;

        let code = parse_pasted_code(&input, &pkce.state)?;
        info!("Exchanging pasted authorization code");
        oauth
            .exchange_code(&code, &self.redirect_uri, &pkce.verifier)
            .await
    }
}

/// Accept either the bare code or the redirect URL containing it.
fn parse_pasted_code(input: &str, expected_state: &str) -> Result<String, AuthError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AuthError::Callback("no authorization code entered".into()));
    }

    match Url::parse(input) {
        Ok(url) => {
            let has_state = url.query_pairs().any(|(k, _)| k == "state");
            code_from_query(&url, has_state.then_some(expected_state))
        }
        Err(_) => Ok(input.to_string()),
    }
}
