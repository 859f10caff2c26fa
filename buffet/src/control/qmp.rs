//! QMP client: newline-delimited JSON over the hypervisor's UNIX socket.

use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use buffet_shared::errors::{BuffetError, BuffetResult};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, sleep, timeout};

use super::credential::generate_credential;
use super::{ControlChannel, DisplayCredential};
use crate::runtime::options::ControlOptions;

#[derive(Debug, Clone, Default)]
pub struct QmpControlChannel {
    options: ControlOptions,
}

impl QmpControlChannel {
    pub fn new(options: ControlOptions) -> Self {
        Self { options }
    }

    /// Connect, retrying with exponential backoff while QEMU creates the socket.
    async fn connect(&self, socket: &Path) -> BuffetResult<UnixStream> {
        let deadline = Instant::now() + self.options.connect_timeout();
        let mut backoff = self.options.initial_backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match UnixStream::connect(socket).await {
                Ok(stream) => {
                    tracing::debug!(socket = %socket.display(), attempts, "QMP connected");
                    return Ok(stream);
                }
                Err(e) if is_unavailable(&e) && Instant::now() + backoff < deadline => {
                    tracing::trace!(socket = %socket.display(), ?backoff, "QMP socket not ready: {}", e);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.options.max_backoff());
                }
                Err(e) => {
                    return Err(BuffetError::ControlChannel(format!(
                        "cannot connect to {} after {} attempts: {}",
                        socket.display(),
                        attempts,
                        e
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl ControlChannel for QmpControlChannel {
    async fn set_display_credential(&self, socket: &Path) -> BuffetResult<DisplayCredential> {
        let stream = self.connect(socket).await?;
        let mut session = QmpSession::new(stream, self.options.io_timeout());
        session.handshake().await?;

        let credential = generate_credential();
        session
            .execute(
                "set_password",
                Some(json!({ "protocol": "vnc", "password": credential.expose() })),
            )
            .await?;

        tracing::info!(socket = %socket.display(), "Display credential set");
        Ok(credential)
    }
}

/// Socket not there yet, or QEMU not listening yet.
fn is_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::PermissionDenied
    )
}

struct QmpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
}

impl QmpSession {
    fn new(stream: UnixStream, io_timeout: Duration) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
            io_timeout,
        }
    }

    /// Read the greeting and leave capabilities negotiation mode.
    async fn handshake(&mut self) -> BuffetResult<()> {
        let greeting = self.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(BuffetError::ControlChannel(format!(
                "unexpected QMP greeting: {}",
                greeting
            )));
        }
        self.execute("qmp_capabilities", None).await?;
        Ok(())
    }

    /// Send a command and wait for its reply, skipping asynchronous events.
    async fn execute(&mut self, command: &str, arguments: Option<Value>) -> BuffetResult<Value> {
        let mut payload = json!({ "execute": command });
        if let Some(arguments) = arguments {
            payload["arguments"] = arguments;
        }
        let mut line = serde_json::to_string(&payload)?;
        line.push('\n');

        timeout(self.io_timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| timed_out("writing", command))?
            .map_err(|e| BuffetError::ControlChannel(format!("write failed: {}", e)))?;

        loop {
            let mut message = self.read_message().await?;
            if let Some(ret) = message.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(error) = message.get("error") {
                let class = error.get("class").and_then(Value::as_str).unwrap_or("Error");
                let desc = error.get("desc").and_then(Value::as_str).unwrap_or("");
                return Err(BuffetError::ControlChannel(format!(
                    "{} rejected: {}: {}",
                    command, class, desc
                )));
            }
            if let Some(event) = message.get("event") {
                tracing::trace!(%event, "Skipping QMP event");
            }
        }
    }

    async fn read_message(&mut self) -> BuffetResult<Value> {
        let mut line = String::new();
        let bytes = timeout(self.io_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| timed_out("reading", "reply"))?
            .map_err(|e| BuffetError::ControlChannel(format!("read failed: {}", e)))?;
        if bytes == 0 {
            return Err(BuffetError::ControlChannel(
                "QMP connection closed unexpectedly".into(),
            ));
        }
        serde_json::from_str(&line)
            .map_err(|e| BuffetError::ControlChannel(format!("malformed QMP message: {}", e)))
    }
}

fn timed_out(action: &str, what: &str) -> BuffetError {
    BuffetError::ControlChannel(format!("timed out {} QMP {}", action, what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::TempDir;

    const GREETING: &str =
        r#"{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0}},"capabilities":[]}}"#;

    fn fast_options() -> ControlOptions {
        ControlOptions {
            connect_timeout_ms: 1000,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            io_timeout_ms: 1000,
        }
    }

    /// Serve one QMP connection, answering commands via `reply`.
    /// Every received command is forwarded on the returned channel.
    fn fake_qmp(
        listener: UnixListener,
        greeting: &'static str,
        reply: fn(&str) -> &'static str,
    ) -> (thread::JoinHandle<()>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            stream.write_all(greeting.as_bytes()).unwrap();
            stream.write_all(b"\n").unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let value: Value = serde_json::from_str(&line).unwrap();
                let command = value["execute"].as_str().unwrap_or_default().to_string();
                let _ = tx.send(value);
                if stream.write_all(reply(&command).as_bytes()).is_err() {
                    break;
                }
                let _ = stream.write_all(b"\n");
            }
        });
        (handle, rx)
    }

    fn socket_path(dir: &TempDir) -> PathBuf {
        dir.path().join("qmp-u1.sock")
    }

    #[tokio::test]
    async fn test_sets_vnc_password() {
        let dir = TempDir::new().unwrap();
        let socket = socket_path(&dir);
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, commands) = fake_qmp(listener, GREETING, |_| r#"{"return":{}}"#);

        let channel = QmpControlChannel::new(fast_options());
        let credential = channel.set_display_credential(&socket).await.unwrap();
        drop(channel);
        server.join().unwrap();

        let received: Vec<Value> = commands.try_iter().collect();
        assert_eq!(received[0]["execute"], "qmp_capabilities");
        assert_eq!(received[1]["execute"], "set_password");
        assert_eq!(received[1]["arguments"]["protocol"], "vnc");
        assert_eq!(received[1]["arguments"]["password"], credential.expose());
    }

    #[tokio::test]
    async fn test_events_before_reply_are_skipped() {
        let dir = TempDir::new().unwrap();
        let socket = socket_path(&dir);
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, _) = fake_qmp(listener, GREETING, |command| match command {
            "set_password" => {
                "{\"event\":\"VNC_CONNECTED\",\"data\":{}}\n{\"return\":{}}"
            }
            _ => r#"{"return":{}}"#,
        });

        let channel = QmpControlChannel::new(fast_options());
        assert!(channel.set_display_credential(&socket).await.is_ok());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_is_control_channel_error() {
        let dir = TempDir::new().unwrap();
        let socket = socket_path(&dir);
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, _) = fake_qmp(listener, GREETING, |command| match command {
            "set_password" => {
                r#"{"error":{"class":"GenericError","desc":"Could not set password"}}"#
            }
            _ => r#"{"return":{}}"#,
        });

        let channel = QmpControlChannel::new(fast_options());
        let err = channel.set_display_credential(&socket).await.unwrap_err();
        server.join().unwrap();
        match err {
            BuffetError::ControlChannel(msg) => assert!(msg.contains("Could not set password")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bogus_greeting_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = socket_path(&dir);
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, _) = fake_qmp(listener, r#"{"bogus":"not-qmp"}"#, |_| r#"{"return":{}}"#);

        let channel = QmpControlChannel::new(fast_options());
        let err = channel.set_display_credential(&socket).await.unwrap_err();
        drop(channel);
        server.join().unwrap();
        assert!(err.to_string().contains("unexpected QMP greeting"));
    }

    #[tokio::test]
    async fn test_missing_socket_gives_up_after_timeout() {
        let dir = TempDir::new().unwrap();
        let mut options = fast_options();
        options.connect_timeout_ms = 100;

        let channel = QmpControlChannel::new(options);
        let started = std::time::Instant::now();
        let err = channel
            .set_display_credential(&socket_path(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, BuffetError::ControlChannel(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_late_socket_is_retried() {
        let dir = TempDir::new().unwrap();
        let socket = socket_path(&dir);
        let bind_path = socket.clone();

        let server = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let listener = UnixListener::bind(&bind_path).unwrap();
            let (server, _) = fake_qmp(listener, GREETING, |_| r#"{"return":{}}"#);
            server.join().unwrap();
        });

        let channel = QmpControlChannel::new(fast_options());
        assert!(channel.set_display_credential(&socket).await.is_ok());
        server.join().unwrap();
    }
}
