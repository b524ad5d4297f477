/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::io;
use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustls::pki_types::PrivateKeyDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::{ListenerSection, Protocol, TlsSection};
use crate::proxy;
use crate::systemd;

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

/// A bidirectional connection stream handed to a protocol session.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    fn is_tls(&self) -> bool;
}

impl SessionStream for TcpStream {
    fn is_tls(&self) -> bool {
        false
    }
}

impl SessionStream for UnixStream {
    fn is_tls(&self) -> bool {
        false
    }
}

impl<T: SessionStream> SessionStream for TlsStream<T> {
    fn is_tls(&self) -> bool {
        true
    }
}

/// Immutable per-listener state shared by all its sessions.
pub struct ServerInstance {
    pub id: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub proxy_protocol: bool,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub tls_implicit: bool,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl ServerInstance {
    pub async fn tls_accept<T: SessionStream>(
        &self,
        stream: T,
    ) -> Result<TlsStream<T>, String> {
        let acceptor = self
            .tls_acceptor
            .as_ref()
            .ok_or_else(|| "TLS is not configured on this listener".to_string())?;
        acceptor
            .accept(stream)
            .await
            .map_err(|err| format!("TLS handshake failed: {}", err))
    }
}

pub struct SessionData<T> {
    pub stream: T,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub session_id: u64,
    pub instance: Arc<ServerInstance>,
}

pub trait SessionManager: Clone + Send + Sync + 'static {
    fn spawn<T: SessionStream>(&self, session: SessionData<T>);
    fn shutdown(&self);
}

pub fn build_tls_acceptor(tls: &TlsSection) -> Result<TlsAcceptor, String> {
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(
        std::fs::File::open(&tls.certificate)
            .map_err(|err| format!("{}: {}", tls.certificate, err))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|err| format!("{}: {}", tls.certificate, err))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut io::BufReader::new(
        std::fs::File::open(&tls.private_key)
            .map_err(|err| format!("{}: {}", tls.private_key, err))?,
    ))
    .map_err(|err| format!("{}: {}", tls.private_key, err))?
    .ok_or_else(|| format!("{}: no private key found", tls.private_key))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| format!("TLS configuration: {}", err))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Binds a listener endpoint and spawns its accept loop. Returns once the
/// socket is bound; accepted connections are handed to the manager.
pub async fn spawn_listener<M: SessionManager>(
    section: ListenerSection,
    hostname: String,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
    manager: M,
) -> io::Result<()> {
    let instance = Arc::new(ServerInstance {
        id: format!("{}:{}", section.protocol.as_str(), section.address),
        protocol: section.protocol,
        hostname,
        proxy_protocol: section.proxy,
        tls_implicit: matches!(section.protocol, Protocol::Imaps) || section.tls,
        tls_acceptor,
        shutdown_rx: shutdown_rx.clone(),
    });

    if let Some(endpoint) = systemd::parse_endpoint(&section.address) {
        let endpoint = endpoint.map_err(io::Error::other)?;
        let fd = systemd::take_fd(endpoint)?;
        match endpoint.domain {
            systemd::Domain::Inet => {
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(std_listener)?;
                spawn_tcp_accept_loop(listener, instance, shutdown_rx, manager);
            }
            systemd::Domain::Unix => {
                let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
                std_listener.set_nonblocking(true)?;
                let listener = UnixListener::from_std(std_listener)?;
                spawn_unix_accept_loop(listener, instance, shutdown_rx, manager);
            }
        }
    } else if let Some(path) = section.address.strip_prefix("unix:") {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        spawn_unix_accept_loop(listener, instance, shutdown_rx, manager);
    } else {
        let listener = TcpListener::bind(&section.address).await?;
        spawn_tcp_accept_loop(listener, instance, shutdown_rx, manager);
    }
    Ok(())
}

fn spawn_tcp_accept_loop<M: SessionManager>(
    listener: TcpListener,
    instance: Arc<ServerInstance>,
    mut shutdown_rx: watch::Receiver<bool>,
    manager: M,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((mut stream, remote_addr)) => {
                            let mut remote_addr = Some(remote_addr);
                            let mut local_addr = stream.local_addr().ok();
                            if instance.proxy_protocol {
                                match proxy::read_v2_header(&mut stream).await {
                                    Ok(addresses) => {
                                        if addresses.source.is_some() {
                                            remote_addr = addresses.source;
                                        }
                                        if addresses.destination.is_some() {
                                            local_addr = addresses.destination;
                                        }
                                    }
                                    Err(err) => {
                                        tracing::debug!(
                                            listener = instance.id.as_str(),
                                            event = "proxy-error",
                                            reason = %err,
                                            "Rejecting connection without PROXY preamble."
                                        );
                                        continue;
                                    }
                                }
                            }
                            manager.spawn(SessionData {
                                stream,
                                remote_addr,
                                local_addr,
                                session_id: SESSION_IDS.fetch_add(1, Ordering::Relaxed),
                                instance: instance.clone(),
                            });
                        }
                        Err(err) => {
                            tracing::debug!(
                                listener = instance.id.as_str(),
                                event = "accept-error",
                                reason = %err,
                                "Failed to accept connection."
                            );
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    manager.shutdown();
                    break;
                }
            }
        }
    });
}

fn spawn_unix_accept_loop<M: SessionManager>(
    listener: UnixListener,
    instance: Arc<ServerInstance>,
    mut shutdown_rx: watch::Receiver<bool>,
    manager: M,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((mut stream, _)) => {
                            let mut remote_addr = None;
                            let mut local_addr = None;
                            if instance.proxy_protocol {
                                match proxy::read_v2_header(&mut stream).await {
                                    Ok(addresses) => {
                                        remote_addr = addresses.source;
                                        local_addr = addresses.destination;
                                    }
                                    Err(err) => {
                                        tracing::debug!(
                                            listener = instance.id.as_str(),
                                            event = "proxy-error",
                                            reason = %err,
                                            "Rejecting connection without PROXY preamble."
                                        );
                                        continue;
                                    }
                                }
                            }
                            manager.spawn(SessionData {
                                stream,
                                remote_addr,
                                local_addr,
                                session_id: SESSION_IDS.fetch_add(1, Ordering::Relaxed),
                                instance: instance.clone(),
                            });
                        }
                        Err(err) => {
                            tracing::debug!(
                                listener = instance.id.as_str(),
                                event = "accept-error",
                                reason = %err,
                                "Failed to accept connection."
                            );
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    manager.shutdown();
                    break;
                }
            }
        }
    });
}
