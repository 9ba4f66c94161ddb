//! Phone-home HTTP server (C9): a single `POST /` endpoint that receives
//! cloud-init's first-boot callback and serializes every report through
//! one consumer task running a fixed ordered hook chain.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::{ConnectInfo, Form, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::VmBuilderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOs {
    Unix,
    Windows,
}

fn guess_os(user_agent: Option<&str>) -> GuestOs {
    match user_agent {
        Some(ua) if ua.contains("Windows") => GuestOs::Windows,
        _ => GuestOs::Unix,
    }
}

#[derive(Debug, Clone)]
pub struct GuestReport {
    pub hostname: String,
    pub ip: String,
    pub ssh_key: String,
    pub instance_id: String,
    pub user_agent: Option<String>,
    pub os: GuestOs,
}

#[derive(Debug, Deserialize)]
struct PhoneHomeForm {
    hostname: String,
    pub_key_rsa: String,
    instance_id: String,
}

pub type Hook = Box<dyn Fn(GuestReport) -> BoxFuture<'static, Result<(), VmBuilderError>> + Send + Sync>;

enum QueueItem {
    Report(GuestReport),
    Stop,
}

#[derive(Clone)]
struct AppState {
    tx: mpsc::UnboundedSender<QueueItem>,
}

async fn handle_post(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<PhoneHomeForm>,
) -> impl IntoResponse {
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string);
    let report = GuestReport {
        hostname: form.hostname,
        ip: addr.ip().to_string(),
        ssh_key: form.pub_key_rsa.trim().to_string(),
        instance_id: form.instance_id,
        os: guess_os(user_agent.as_deref()),
        user_agent,
    };
    // The guest has no way to retry meaningfully; always 200, even if our
    // consumer task later fails a hook. Failures surface through the
    // orchestrator's own error channel, not the HTTP response.
    let _ = state.tx.send(QueueItem::Report(report));
    axum::http::StatusCode::OK
}

/// A running phone-home server: the router to serve, and a handle used to
/// request early shutdown.
pub struct PhoneHomeServer {
    pub router: Router,
    stop_tx: mpsc::UnboundedSender<QueueItem>,
    stopped: Arc<AtomicBool>,
}

impl PhoneHomeServer {
    /// Build the server and spawn its consumer task. `expected` is the set
    /// of hostnames (any case) to wait for; `hooks` run in order for every
    /// report, before the next report is dequeued.
    pub fn spawn(expected: HashSet<String>, hooks: Vec<Hook>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_stopped = stopped.clone();
        let expected: HashSet<String> = expected.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        let consumer = tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            while !expected.is_subset(&seen) {
                let Some(item) = rx.recv().await else { break };
                if worker_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let report = match item {
                    QueueItem::Report(r) => r,
                    QueueItem::Stop => break,
                };
                for hook in &hooks {
                    if let Err(e) = hook(report.clone()).await {
                        tracing::error!(hostname = %report.hostname, error = %e, "phone-home hook failed");
                    }
                }
                let hostname = report.hostname.to_ascii_lowercase();
                if expected.contains(&hostname) {
                    seen.insert(hostname);
                } else {
                    tracing::info!(hostname = %report.hostname, "guest reported outside the expected set, ignoring for termination");
                }
            }
            tracing::info!("phone-home worker done, all expected guests reported");
        });

        let state = AppState { tx: tx.clone() };
        let router = Router::new().route("/", post(handle_post)).with_state(state);

        (Self { router, stop_tx: tx, stopped }, consumer)
    }

    /// Request the consumer to stop even if not every guest has reported.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(QueueItem::Stop);
    }
}

/// Build the standard hook chain: known-hosts update (skipped for Windows),
/// an orchestrator-supplied admission hook, inventory + ssh-config updates,
/// then a log line. Callers compose the concrete closures since C2/C8 state
/// (an `InventoryGenerator`, an `SshConfigGenerator`) lives with the
/// orchestrator, not this module.
pub fn report_ready_hook() -> Hook {
    Box::new(|report: GuestReport| {
        Box::pin(async move {
            tracing::info!(hostname = %report.hostname, ssh_key = %report.ssh_key, "vm ready");
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_os_detects_windows_user_agent() {
        assert_eq!(guess_os(Some("cloud-init/Windows 10")), GuestOs::Windows);
    }

    #[test]
    fn guess_os_defaults_to_unix() {
        assert_eq!(guess_os(Some("cloud-init/23.1")), GuestOs::Unix);
        assert_eq!(guess_os(None), GuestOs::Unix);
    }

    #[tokio::test]
    async fn worker_terminates_once_expected_set_is_seen() {
        let expected: HashSet<String> = ["web1".into()].into_iter().collect();
        let (server, consumer) = PhoneHomeServer::spawn(expected, vec![]);
        server
            .stop_tx
            .send(QueueItem::Report(GuestReport {
                hostname: "WEB1".into(),
                ip: "10.0.0.2".into(),
                ssh_key: "ssh-rsa AAA".into(),
                instance_id: "abc".into(),
                user_agent: None,
                os: GuestOs::Unix,
            }))
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), consumer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_unblocks_worker_before_expected_set_is_seen() {
        let expected: HashSet<String> = ["web1".into(), "web2".into()].into_iter().collect();
        let (server, consumer) = PhoneHomeServer::spawn(expected, vec![]);
        server.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), consumer).await.unwrap().unwrap();
    }
}
