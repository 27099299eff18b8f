//! Socket client and output rendering.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use ramp_common::protocol::{Request, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send one request to the daemon and read its response line.
pub async fn send_request(socket: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to rampd at {} (is it running?)", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await?
        .context("daemon closed the connection without a response")?;
    serde_json::from_str(&line).context("unparseable response from daemon")
}

/// Print a response; daemon-reported errors become a nonzero exit.
pub fn render_response(response: &Response) -> Result<()> {
    if let Response::Error { message } = response {
        bail!("daemon error: {message}");
    }
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

/// Parse an optional RFC 3339 timestamp argument.
pub fn parse_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("invalid RFC 3339 timestamp: {s}"))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_accepts_rfc3339() {
        let parsed = parse_timestamp(Some("2026-08-05T12:00:00Z")).unwrap();
        assert!(parsed.is_some());
        assert!(parse_timestamp(None).unwrap().is_none());
        assert!(parse_timestamp(Some("yesterday")).is_err());
    }

    #[test]
    fn test_render_error_response_fails() {
        let result = render_response(&Response::error("flag not found: ghost"));
        assert!(result.is_err());
    }
}
