use std::sync::Arc;

use anyhow::{Context, bail};
use secrecy::SecretString;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_relay::config::RelayConfig;
use mail_relay::mailbox::{ImapConnector, Provider};
use mail_relay::platform::TelegramClient;
use mail_relay::queue::LibSqlQueue;
use mail_relay::relay::{
    Broadcaster, MembershipWatcher, Poller, spawn_broadcaster, spawn_membership_watcher,
    spawn_poller,
};
use mail_relay::store::{Database, LibSqlBackend, NewAccount};

const USAGE: &str = "usage: mail-relay [add-account <user_id> <provider> <address>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("failed to install rustls crypto provider");
    }

    let config = RelayConfig::from_env().context("loading configuration")?;
    let _log_guard = init_tracing(&config);

    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    let db = Arc::new(backend);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("add-account") => add_account(db.as_ref(), &args[1..]).await,
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
        None => run(config, db).await,
    }
}

/// Log to stderr, plus a daily-rolling file when a log dir is configured.
fn init_tracing(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// One-shot: register a mailbox. The app password comes from
/// `MAIL_RELAY_ACCOUNT_SECRET` so it never shows up in shell history.
async fn add_account(db: &dyn Database, args: &[String]) -> anyhow::Result<()> {
    let [user_id, provider, address] = args else {
        bail!("{USAGE}");
    };
    let user_id: i64 = user_id
        .parse()
        .with_context(|| format!("user_id must be an integer, got {user_id:?}"))?;
    let provider: Provider = provider.parse().map_err(anyhow::Error::msg)?;
    let secret = std::env::var("MAIL_RELAY_ACCOUNT_SECRET")
        .context("MAIL_RELAY_ACCOUNT_SECRET must hold the mailbox password")?;

    let account = db
        .insert_account(&NewAccount {
            user_id,
            provider,
            address: address.trim().to_string(),
            secret: SecretString::from(secret),
        })
        .await
        .context("creating account")?;

    tracing::info!(
        account_id = account.id,
        user_id,
        provider = %provider,
        "Account added; promote the bot in a forum group to start relaying"
    );
    Ok(())
}

async fn run(config: RelayConfig, db: Arc<LibSqlBackend>) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path.display(),
        cache = %config.cache_dir.display(),
        "Mail relay starting"
    );

    let telegram = Arc::new(TelegramClient::new(&config.telegram));
    let mailbox = Arc::new(ImapConnector::new(
        config.imap.clone(),
        config.broadcaster.segment_size,
    ));
    let queue = Arc::new(LibSqlQueue::new(db.connection(), config.queue.clone()));

    let poller = Arc::new(Poller::new(
        db.clone(),
        mailbox.clone(),
        queue.clone(),
        config.poller.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new(
        db.clone(),
        mailbox,
        queue,
        telegram.clone(),
        config.broadcaster.clone(),
        config.cache_dir.clone(),
    ));
    let watcher = Arc::new(MembershipWatcher::new(telegram, db));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = [
        spawn_poller(poller, shutdown_rx.clone()),
        spawn_broadcaster(broadcaster, shutdown_rx.clone()),
        spawn_membership_watcher(watcher, shutdown_rx),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested, finishing in-flight work");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Relay task panicked");
        }
    }
    tracing::info!("Mail relay stopped");
    Ok(())
}
