/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use common::config::{Config, Protocol};
use common::listener::{build_tls_acceptor, spawn_listener};
use imap::core::session::ImapSessionManager;
use imap::core::{Imap, ImapConfig};
use smtp::inbound::SmtpSessionManager;
use smtp::queue::manager::SpoolManager;
use smtp::queue::SpoolHalt;
use smtp::{SmtpConfig, SmtpCore};
use store::watch::MailboxWatches;
use store::{Store, StoreConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/loriot/loriot.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("loriot: {}", err);
            std::process::exit(1);
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime")
        .block_on(run(config));
}

async fn run(config: Config) {
    let store = match Store::open(
        StoreConfig {
            host: config.store.host.clone(),
            port: config.store.port,
            database: config.store.database.clone(),
            user: config.store.user.clone(),
            password: config.store.password.clone(),
            max_connections: config.store.pool_size,
            connect_timeout: Duration::from_secs(10),
        },
        true,
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(event = "startup", reason = %err, "Cannot open the store.");
            std::process::exit(1);
        }
    };

    let tls_acceptor = match &config.tls {
        Some(tls) => match build_tls_acceptor(tls) {
            Ok(acceptor) => Some(acceptor),
            Err(err) => {
                tracing::error!(event = "startup", reason = %err, "Cannot load TLS keys.");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watches = Arc::new(MailboxWatches::new());
    let imap = Arc::new(Imap::new(
        ImapConfig::from(&config.hostname, &config.imap),
        store.clone(),
        config.imap.message_cache_size,
        watches.clone(),
    ));
    let smtp_core = Arc::new(SmtpCore {
        config: SmtpConfig::from(&config.hostname, &config.smtp, &config.queue),
        store: store.clone(),
        watches,
    });

    let imap_manager = ImapSessionManager::new(imap);
    let smtp_manager = SmtpSessionManager::new(smtp_core.clone());

    for listener in &config.listeners {
        let result = match listener.protocol {
            Protocol::Imap | Protocol::Imaps => {
                spawn_listener(
                    listener.clone(),
                    config.hostname.clone(),
                    tls_acceptor.clone(),
                    shutdown_rx.clone(),
                    imap_manager.clone(),
                )
                .await
            }
            Protocol::Smtp | Protocol::Submission | Protocol::Lmtp => {
                spawn_listener(
                    listener.clone(),
                    config.hostname.clone(),
                    tls_acceptor.clone(),
                    shutdown_rx.clone(),
                    smtp_manager.clone(),
                )
                .await
            }
        };
        match result {
            Ok(()) => {
                tracing::info!(event = "listen",
                    protocol = listener.protocol.as_str(),
                    address = listener.address.as_str(),
                    "Listener started.");
            }
            Err(err) => {
                tracing::error!(event = "startup", reason = %err,
                    address = listener.address.as_str(), "Cannot bind listener.");
                std::process::exit(1);
            }
        }
    }

    SpoolManager::new(smtp_core, SpoolHalt::new()).spawn();

    tracing::info!(event = "started", hostname = config.hostname.as_str(),
        "Loriot mail server running.");

    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
    tokio::select! {
        _ = sigterm.recv() => (),
        _ = sigint.recv() => (),
    }
    tracing::info!(event = "shutdown", "Shutting down.");
    let _ = shutdown_tx.send(true);
    // Give sessions a moment to flush their BYEs.
    tokio::time::sleep(Duration::from_millis(500)).await;
}
