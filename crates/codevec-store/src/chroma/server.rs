//! Bundled Chroma server lifecycle.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::error::{Result, StoreError};

pub const LOG_FILE_NAME: &str = "chroma.log";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bind port 0 and return the port the OS picked.
///
/// # Errors
///
/// Returns an error if no local port can be bound.
pub fn ephemeral_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Whether a Chroma server answers its heartbeat at `base_url` (v2, then v1).
pub async fn try_server(http: &reqwest::Client, base_url: &str) -> bool {
    let base = base_url.trim_end_matches('/');
    for version in ["v2", "v1"] {
        match http.get(format!("{base}/api/{version}/heartbeat")).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                tracing::debug!(url = base, version, status = %response.status(), "heartbeat rejected");
            }
            Err(e) => {
                tracing::debug!(url = base, "heartbeat failed: {e}");
                return false;
            }
        }
    }
    false
}

/// Poll the heartbeat every 100 ms until it succeeds or `timeout` elapses.
///
/// # Errors
///
/// Returns [`StoreError::ServerTimeout`] if the server never answered.
pub async fn wait_for_server(http: &reqwest::Client, base_url: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if try_server(http, base_url).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StoreError::ServerTimeout {
                url: base_url.to_owned(),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A Chroma server child process owned by this run.
#[derive(Debug)]
pub struct BundledServer {
    child: Child,
    url: String,
}

impl BundledServer {
    /// Spawn `command --host 127.0.0.1 --port <ephemeral> --path <db_path>` with
    /// output appended to `<log_dir>/chroma.log`, then wait for its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Spawn`] if the process cannot start and
    /// [`StoreError::ServerTimeout`] if it never becomes healthy.
    pub async fn start(
        http: &reqwest::Client,
        command: &[String],
        db_path: &Path,
        log_dir: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(StoreError::Config("empty server command".into()));
        };
        tokio::fs::create_dir_all(db_path).await?;
        tokio::fs::create_dir_all(log_dir).await?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(LOG_FILE_NAME))?;
        let log_err = log.try_clone()?;

        let port = ephemeral_port()?;
        let url = format!("http://127.0.0.1:{port}");
        tracing::warn!(%url, db = %db_path.display(), "starting bundled Chroma server");

        let child = Command::new(program)
            .args(args)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--path")
            .arg(db_path)
            .env("ANONYMIZED_TELEMETRY", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoreError::Spawn(format!("{program}: {e}")))?;

        let mut server = Self { child, url };
        if let Err(e) = wait_for_server(http, &server.url, timeout).await {
            server.shutdown().await;
            return Err(e);
        }
        Ok(server)
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Terminate the process and wait for it to exit.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("bundled server already exited: {e}");
        }
        match self.child.wait().await {
            Ok(status) => tracing::debug!(%status, url = %self.url, "bundled server stopped"),
            Err(e) => tracing::warn!("failed to wait for bundled server: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn ephemeral_port_is_nonzero() {
        assert_ne!(ephemeral_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn heartbeat_v2() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/heartbeat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nanosecond heartbeat": 1
            })))
            .mount(&server)
            .await;
        assert!(try_server(&reqwest::Client::new(), &server.uri()).await);
    }

    #[tokio::test]
    async fn heartbeat_falls_back_to_v1() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(try_server(&reqwest::Client::new(), &server.uri()).await);
    }

    #[tokio::test]
    async fn wait_times_out_on_closed_port() {
        let port = ephemeral_port().unwrap();
        let url = format!("http://127.0.0.1:{port}");
        let err = wait_for_server(&reqwest::Client::new(), &url, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ServerTimeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundledServer::start(
            &reqwest::Client::new(),
            &["codevec-no-such-binary".into()],
            &dir.path().join("db"),
            dir.path(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Spawn(_)));
    }

    #[tokio::test]
    async fn empty_command_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundledServer::start(
            &reqwest::Client::new(),
            &[],
            dir.path(),
            dir.path(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
