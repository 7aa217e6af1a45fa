//! Control plane: newline-delimited JSON over a local unix stream socket.
//!
//! One request per connection: read a `{cmd, ...}` line, hand it to the
//! daemon, write back `{ok: true, result}` or `{ok: false, error}`. Lines
//! are capped at 2 MiB (frame fetches carry base64 JPEGs). The socket file
//! is owner-only (0o600).

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Maximum request/response line length.
pub const MAX_LINE: u64 = 2 * 1024 * 1024;

/// A parsed request travelling from the socket task to the daemon, with a
/// one-shot channel for the reply.
pub struct IpcRequest {
    pub msg: Value,
    pub respond: oneshot::Sender<Result<Value>>,
}

/// Bind the control socket, replacing a stale file, and serve forever.
/// Each accepted connection is handled on its own task.
pub async fn serve(path: &Path, tx: mpsc::Sender<IpcRequest>) -> Result<()> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| Error::FatalInit(format!("cannot bind {}: {e}", path.display())))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    debug!(path = %path.display(), "IPC socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, tx).await {
                warn!(error = %e, kind = e.kind(), "IPC connection error");
            }
        });
    }
}

async fn read_line_capped(stream: &mut UnixStream) -> Result<Option<String>> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let n = (&mut reader)
        .take(MAX_LINE)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n as u64 >= MAX_LINE {
        return Err(Error::protocol("request exceeds 2 MiB limit"));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn serve_one(mut stream: UnixStream, tx: mpsc::Sender<IpcRequest>) -> Result<()> {
    let Some(line) = read_line_capped(&mut stream).await? else {
        return Ok(());
    };

    let outcome: Result<Value> = async {
        let msg: Value =
            serde_json::from_str(line.trim()).map_err(|e| Error::protocol(format!("bad JSON: {e}")))?;
        let (respond, rx) = oneshot::channel();
        tx.send(IpcRequest { msg, respond })
            .await
            .map_err(|_| Error::state("daemon is shutting down"))?;
        rx.await.map_err(|_| Error::state("daemon dropped the request"))?
    }
    .await;

    let reply = match outcome {
        Ok(result) => json!({"ok": true, "result": result}),
        Err(e) => json!({"ok": false, "error": e.to_string(), "kind": e.kind()}),
    };
    let mut encoded = serde_json::to_vec(&reply)?;
    encoded.push(b'\n');
    stream.write_all(&encoded).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Client side: send one request, await one response.
pub async fn send(path: impl Into<PathBuf>, payload: &Value) -> Result<Value> {
    let path = path.into();
    let mut stream = UnixStream::connect(&path).await?;
    let mut encoded = serde_json::to_vec(payload)?;
    encoded.push(b'\n');
    stream.write_all(&encoded).await?;

    let Some(line) = read_line_capped(&mut stream).await? else {
        return Err(Error::protocol("no response"));
    };
    let resp: Value = serde_json::from_str(line.trim())?;
    if resp.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    } else {
        let err = resp
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(Error::protocol(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_daemon(mut rx: mpsc::Receiver<IpcRequest>) {
        while let Some(req) = rx.recv().await {
            let reply = match req.msg.get("cmd").and_then(Value::as_str) {
                Some("ping") => Ok(json!({"pong": true})),
                Some(other) => Err(Error::protocol(format!("unknown cmd: {other}"))),
                None => Err(Error::protocol("missing cmd")),
            };
            let _ = req.respond.send(reply);
        }
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ctl.sock");
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(echo_daemon(rx));
        let server_sock = sock.clone();
        tokio::spawn(async move {
            let _ = serve(&server_sock, tx).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let result = send(&sock, &json!({"cmd": "ping"})).await.unwrap();
        assert_eq!(result, json!({"pong": true}));

        let err = send(&sock, &json!({"cmd": "nope"})).await.unwrap_err();
        assert!(err.to_string().contains("unknown cmd"));
    }

    #[tokio::test]
    async fn socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ctl.sock");
        let (tx, _rx) = mpsc::channel(8);
        let server_sock = sock.clone();
        tokio::spawn(async move {
            let _ = serve(&server_sock, tx).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mode = std::fs::metadata(&sock).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
