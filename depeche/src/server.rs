use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{watch, Notify};

use depeche_mail::bodies::Bodies;
use depeche_mail::ingest::Ingestor;
use depeche_mail::janitor::Janitor;
use depeche_mail::maintenance::CacheMaintenance;
use depeche_mail::uploader::Uploader;
use depeche_meta::MetaStore;
use depeche_proto::{imap, lmtp, managesieve, pop3, tls, Backend};
use depeche_storage::cache::LocalCache;
use depeche_storage::object::ObjectStore;
use depeche_storage::spool::Spool;
use depeche_user::config::Config;

/// Bring the whole daemon up: storage tiers, background workers, protocol
/// listeners; then wait for SIGINT/SIGTERM and drain everything.
pub async fn run(config: Config) -> Result<()> {
    if !config.servers.any_enabled() {
        bail!("all servers are disabled in the configuration, nothing to do");
    }

    // Fatal init errors exit non-zero before any listener opens.
    let meta = Arc::new(
        MetaStore::connect(&config.database)
            .await
            .context("database is unreachable")?,
    );
    let store = Arc::new(ObjectStore::new(&config.s3));
    store
        .check_credentials()
        .await
        .context("object-store credentials rejected")?;
    let cache = Arc::new(LocalCache::open(&config.local_cache).context("local cache")?);
    let spool = Arc::new(Spool::open(&config.uploader).context("staging spool")?);

    let upload_notify = Arc::new(Notify::new());
    let bodies = Arc::new(Bodies::new(cache.clone(), store.clone(), spool.clone()));
    let ingest = Arc::new(Ingestor::new(
        meta.clone(),
        spool.clone(),
        upload_notify.clone(),
    ));
    let backend = Arc::new(Backend {
        meta: meta.clone(),
        bodies,
        ingest,
        servers: config.servers.clone(),
        insecure_auth: config.insecure_auth,
    });

    let tls_acceptor = config
        .tls
        .as_ref()
        .map(tls::acceptor)
        .transpose()
        .context("loading TLS certificate")?;

    let (exit_tx, exit_rx) = watch::channel(false);
    let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

    // Background workers first: the uploader must already be draining the
    // queue left over from a previous run before any new mail arrives.
    let uploader = Uploader::new(
        meta.clone(),
        store.clone(),
        cache.clone(),
        spool.clone(),
        upload_notify,
        config.uploader.clone(),
    );
    tasks.push(("uploader", tokio::spawn(uploader.run(exit_rx.clone()))));

    let janitor = Janitor::new(meta.clone(), store.clone(), cache.clone(), &config.cleanup);
    tasks.push(("janitor", tokio::spawn(janitor.run(exit_rx.clone()))));

    let maintenance = CacheMaintenance::new(cache.clone(), meta.clone());
    tasks.push(("cache", tokio::spawn(maintenance.run(exit_rx.clone()))));

    // Protocol listeners.
    if config.servers.start_imap {
        let srv = imap::new(
            config.servers.imap_addr,
            backend.clone(),
            tls_acceptor.clone(),
        );
        let rx = exit_rx.clone();
        tasks.push((
            "imap",
            tokio::spawn(async move {
                if let Err(e) = srv.run(rx).await {
                    tracing::error!(err = %e, "IMAP server failed");
                }
            }),
        ));
    }
    if config.servers.start_lmtp {
        let srv = lmtp::LmtpServer::new(
            config.servers.lmtp_addr,
            &config.lmtp,
            backend.clone(),
            tls_acceptor.clone(),
            exit_rx.clone(),
        );
        tasks.push((
            "lmtp",
            tokio::spawn(async move {
                if let Err(e) = srv.run().await {
                    tracing::error!(err = %e, "LMTP server failed");
                }
            }),
        ));
    }
    if config.servers.start_pop3 {
        let srv = pop3::Pop3Server::new(
            config.servers.pop3_addr,
            backend.clone(),
            tls_acceptor.clone(),
        );
        let rx = exit_rx.clone();
        tasks.push((
            "pop3",
            tokio::spawn(async move {
                if let Err(e) = srv.run(rx).await {
                    tracing::error!(err = %e, "POP3 server failed");
                }
            }),
        ));
    }
    if config.servers.start_managesieve {
        let srv = managesieve::ManageSieveServer::new(
            config.servers.managesieve_addr,
            backend.clone(),
            tls_acceptor,
        );
        let rx = exit_rx.clone();
        tasks.push((
            "managesieve",
            tokio::spawn(async move {
                if let Err(e) = srv.run(rx).await {
                    tracing::error!(err = %e, "ManageSieve server failed");
                }
            }),
        ));
    }

    tracing::info!("dépêche is up");
    wait_for_signal().await?;
    tracing::info!("shutdown signal received, draining...");
    let _ = exit_tx.send(true);

    for (name, task) in tasks {
        if let Err(e) = task.await {
            tracing::warn!(task = name, err = %e, "task ended abnormally");
        }
    }
    tracing::info!("goodbye");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => (),
        _ = sigint.recv() => (),
    }
    Ok(())
}
