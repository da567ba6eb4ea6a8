/// Loopback HTTP listener that receives the OAuth redirect for clients
/// without a browser location of their own
use crate::error::{AuthError, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Listens on `127.0.0.1` on a random port
pub struct LoopbackCallback {
    listener: TcpListener,
    port: u16,
}

impl LoopbackCallback {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Origin of the listener, usable as the client's starting location
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Wait for the first request carrying `code` or `error` and return its
    /// full URL
    ///
    /// Other requests (favicons, health checks) get a 404 and are skipped.
    pub async fn wait_for_callback(&self, timeout: Duration) -> Result<String> {
        match tokio::time::timeout(timeout, self.accept_callback()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::Io(Arc::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "Timeout waiting for callback",
            )))),
        }
    }

    async fn accept_callback(&self) -> Result<String> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            if let Some(url) = self.handle_request(stream).await? {
                return Ok(url);
            }
        }
    }

    async fn handle_request(&self, stream: TcpStream) -> Result<Option<String>> {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;

        // Drain the headers before answering
        let mut header = String::new();
        loop {
            header.clear();
            let read = reader.read_line(&mut header).await?;
            if read == 0 || header.trim().is_empty() {
                break;
            }
        }
        let mut stream = reader.into_inner();

        // GET /callback?code=...&state=... HTTP/1.1
        let Some(target) = request_line.split_whitespace().nth(1) else {
            send_response(&mut stream, "400 Bad Request", "Invalid request").await?;
            return Ok(None);
        };

        let query = target.split_once('?').map(|(_, query)| query).unwrap_or("");
        let has_param = |name: &str| {
            query
                .split('&')
                .any(|pair| pair.split('=').next() == Some(name))
        };

        if has_param("error") {
            send_response(
                &mut stream,
                "400 Bad Request",
                "Authorization failed. You can close this window.",
            )
            .await?;
        } else if has_param("code") {
            send_response(
                &mut stream,
                "200 OK",
                "Authorization successful. You can close this window and return to your terminal.",
            )
            .await?;
        } else {
            debug!(%target, "ignoring request without callback parameters");
            send_response(&mut stream, "404 Not Found", "Not found").await?;
            return Ok(None);
        }

        Ok(Some(format!("http://127.0.0.1:{}{}", self.port, target)))
    }
}

async fn send_response(stream: &mut TcpStream, status: &str, message: &str) -> Result<()> {
    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Sign-in</title></head>\n\
         <body><p>{}</p></body>\n</html>",
        message
    );
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
