use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keyserver_conn::keyserver::FileOpsLog;
use keyserver_conn::protocol::{CalendarQuery, PlatformDetails};
use keyserver_conn::{
    Action, ConnectionConfig, ConnectionDeps, ConnectionEvent, ConnectionHandle, KeyserverInfo,
    KeyserverStore, KeyserverStoreHandle, StaticClientContext, WebSocketTransportFactory,
};

/// Operations between full snapshots of the persisted store.
const SNAPSHOT_EVERY: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "keyserver-conn")]
#[command(about = "Keeps a socket connection to a keyserver and logs what it receives")]
#[command(version)]
struct Cli {
    /// WebSocket endpoint of the keyserver
    #[arg(long)]
    url: String,

    /// Keyserver id (defaults to the configured home keyserver)
    #[arg(long)]
    keyserver_id: Option<String>,

    /// Session cookie, e.g. "user=1:secret"
    #[arg(long, env = "KEYSERVER_CONN_COOKIE")]
    cookie: Option<String>,

    /// HTTP URL prefix of the keyserver, used for session recovery
    #[arg(long, default_value = "http://localhost:3000")]
    url_prefix: String,

    /// YAML config file (defaults plus environment overrides otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the persisted keyserver store
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Platform reported to the keyserver
    #[arg(long, default_value = "web")]
    platform: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("keyserver_conn=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ConnectionConfig::load(path)?,
        None => ConnectionConfig::from_env()?,
    };
    let keyserver_id = cli
        .keyserver_id
        .clone()
        .unwrap_or_else(|| config.home_keyserver_id.clone());

    let store = open_store(&cli, &config)?;
    if store.keyserver_info(&keyserver_id).is_none() {
        store.dispatch(Action::AddKeyserver {
            keyserver_id: keyserver_id.clone(),
            keyserver_info: KeyserverInfo::new(&cli.url_prefix, current_month()?),
        });
    }
    if let Some(cookie) = &cli.cookie {
        store.dispatch(Action::SetNewSession {
            keyserver_id: keyserver_id.clone(),
            session_change: keyserver_conn::protocol::SessionChange {
                cookie_invalidated: false,
                cookie: Some(cookie.clone()),
                current_user_info: None,
                session_id: None,
            },
            pre_request_user_state: None,
            error: None,
            source: None,
        });
    }

    let context = StaticClientContext::new(PlatformDetails {
        platform: cli.platform.clone(),
        code_version: None,
        state_version: None,
    });
    let deps = ConnectionDeps::new(
        Arc::new(WebSocketTransportFactory::new(&cli.url)),
        Arc::new(context),
    );
    let (handle, task) = ConnectionHandle::spawn(keyserver_id.clone(), config, store, deps);
    let mut events = handle.subscribe();
    handle.set_active(true, false).await?;
    info!(keyserver_id = %keyserver_id, url = %cli.url, "Connecting");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await?;
    task.await.context("Connection manager task panicked")?;
    Ok(())
}

fn open_store(cli: &Cli, config: &ConnectionConfig) -> Result<KeyserverStoreHandle> {
    let Some(dir) = &cli.state_dir else {
        return Ok(KeyserverStoreHandle::new(
            KeyserverStore::default(),
            config.home_keyserver_id.clone(),
            config.event_buffer,
        ));
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    let log = FileOpsLog::in_dir(dir, SNAPSHOT_EVERY);
    let initial = log.load()?;
    Ok(KeyserverStoreHandle::with_persistence(
        initial,
        config.home_keyserver_id.clone(),
        config.event_buffer,
        Arc::new(log),
    ))
}

fn current_month() -> Result<CalendarQuery> {
    let today = Local::now().date_naive();
    let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
        .context("Invalid first day of month")?;
    let next = if today.month() == 12 {
        NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
    }
    .context("Invalid first day of next month")?;
    let last = next.pred_opt().context("Invalid last day of month")?;
    Ok(CalendarQuery::new(
        first.format("%Y-%m-%d").to_string(),
        last.format("%Y-%m-%d").to_string(),
    ))
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::StatusChanged {
            keyserver_id,
            status,
        } => info!(keyserver_id = %keyserver_id, %status, "Status changed"),
        ConnectionEvent::Message {
            keyserver_id,
            message,
        } => info!(keyserver_id = %keyserver_id, kind = %message.kind(), "Message"),
        ConnectionEvent::UnsupervisedBackground { keyserver_id } => {
            warn!(keyserver_id = %keyserver_id, "Backgrounded without notice")
        }
        ConnectionEvent::SessionRecovered { keyserver_id } => {
            info!(keyserver_id = %keyserver_id, "Session recovered")
        }
        ConnectionEvent::SessionInvalidated {
            keyserver_id,
            downgrade,
        } => warn!(keyserver_id = %keyserver_id, downgrade, "Session invalidated"),
    }
}
