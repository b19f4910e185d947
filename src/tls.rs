//! TLS termination for the request listener.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::serve::Listener;
use native_tls::{Identity, Protocol};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_native_tls::{TlsAcceptor, TlsStream};
use tracing::{debug, info, warn};
use x509_parser::pem::parse_x509_pem;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting for the server to pick them up.
const READY_BACKLOG: usize = 64;

type Accepted = (TlsStream<TcpStream>, SocketAddr);

/// TCP listener that hands out streams only after their TLS handshake.
///
/// Each handshake runs in its own task, so a slow or silent client cannot hold
/// up other connections. Connections whose handshake fails or stalls are
/// dropped and the listener keeps accepting.
pub struct TlsListener {
    ready: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
    acceptor_task: JoinHandle<()>,
}

impl TlsListener {
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        let (tx, ready) = mpsc::channel(READY_BACKLOG);
        let acceptor_task = tokio::spawn(accept_loop(inner, acceptor, tx));
        Ok(Self {
            ready,
            local_addr,
            acceptor_task,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.acceptor_task.abort();
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(accepted) => accepted,
            None => {
                warn!("TLS accept loop ended, no further connections");
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn accept_loop(mut inner: TcpListener, acceptor: TlsAcceptor, ready: mpsc::Sender<Accepted>) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = ready.closed() => break,
            conn = Listener::accept(&mut inner) => conn,
        };
        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = ready.send((tls, addr)).await;
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%addr, "TLS handshake timed out"),
            }
        });
    }
}

/// Build an acceptor from a PEM certificate chain and a PKCS#8 PEM key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert = std::fs::read(cert_path)
        .with_context(|| format!("failed to read TLS certificate {}", cert_path.display()))?;
    let key = std::fs::read(key_path)
        .with_context(|| format!("failed to read TLS key {}", key_path.display()))?;

    inspect_certificate(&cert);

    let identity = Identity::from_pkcs8(&cert, &key)
        .context("TLS key must be PEM-encoded PKCS#8 matching the certificate")?;
    let acceptor = native_tls::TlsAcceptor::builder(identity)
        .min_protocol_version(Some(Protocol::Tlsv12))
        .build()
        .context("failed to build TLS acceptor")?;
    Ok(TlsAcceptor::from(acceptor))
}

/// Log subject and expiry of the leaf certificate.
fn inspect_certificate(pem_bytes: &[u8]) {
    match certificate_summary(pem_bytes) {
        Ok((subject, not_after, valid)) => {
            if valid {
                info!(%subject, %not_after, "loaded TLS certificate");
            } else {
                warn!(%subject, %not_after, "TLS certificate is outside its validity period");
            }
        }
        Err(e) => warn!(error = %e, "could not inspect TLS certificate"),
    }
}

fn certificate_summary(pem_bytes: &[u8]) -> Result<(String, String, bool)> {
    let (_, pem) = parse_x509_pem(pem_bytes).map_err(|e| anyhow!("invalid PEM: {e}"))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow!("invalid certificate: {e}"))?;
    let validity = cert.validity();
    Ok((
        cert.subject().to_string(),
        validity.not_after.to_string(),
        validity.is_valid(),
    ))
}
