//! Application-facing control socket.
//!
//! The original listens with `multiprocessing.connection.Listener`, which
//! picks a Unix domain socket or a TCP socket from the same `--sock-name`
//! string depending on whether it parses as `host:port`, and frames each
//! request/response pair as one pickled Python tuple per `send`/`recv`. This
//! keeps the same address-string convention but frames with
//! `tokio_util::codec::LengthDelimitedCodec` and encodes each [`IpcRequest`]/
//! [`IpcResponse`] as one length-prefixed JSON document per frame.

use std::sync::Arc;

use anyhow::Context as _;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};

use crate::balancer::LoadBalancer;
use crate::wire::IpcRequest;

/// Listen on `sock_name` forever, spawning one task per application
/// connection. `sock_name` is a `host:port` pair for a TCP listener, or a
/// filesystem path for a Unix domain socket otherwise.
pub async fn run(balancer: Arc<LoadBalancer>, sock_name: &str) -> anyhow::Result<()> {
    if let Some(colon) = sock_name.rfind(':') {
        let host = &sock_name[..colon];
        let port: u16 = sock_name[colon + 1..]
            .parse()
            .with_context(|| format!("invalid IPC port in --sock-name '{sock_name}'"))?;

        let listener = TcpListener::bind((host, port)).await.context("binding IPC tcp listener")?;
        info!(addr = %listener.local_addr()?, "ipc server listening (tcp)");

        loop {
            let (stream, peer) = listener.accept().await?;
            let balancer = balancer.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_application(balancer, stream).await {
                    warn!(peer = %peer, err = %e, "ipc connection ended with error");
                }
            });
        }
    } else {
        run_unix(balancer, sock_name).await
    }
}

#[cfg(unix)]
async fn run_unix(balancer: Arc<LoadBalancer>, path: &str) -> anyhow::Result<()> {
    // A stale socket file from a previous run (e.g. after a crash) would
    // otherwise make bind() fail with "address in use".
    let _ = std::fs::remove_file(path);

    let listener = tokio::net::UnixListener::bind(path).with_context(|| format!("binding IPC unix socket at {path}"))?;
    info!(path, "ipc server listening (unix socket)");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let balancer = balancer.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_application(balancer, stream).await {
                warn!(err = %e, "ipc connection ended with error");
            }
        });
    }
}

#[cfg(not(unix))]
async fn run_unix(_balancer: Arc<LoadBalancer>, _path: &str) -> anyhow::Result<()> {
    anyhow::bail!("unix domain sockets are not supported on this platform; pass host:port in --sock-name instead")
}

/// Serve one application connection until it disconnects or a framing/codec
/// error occurs. Every request/response pair round-trips through the same
/// [`LoadBalancer`] handle every other connection and every device uses.
async fn serve_application<T>(balancer: Arc<LoadBalancer>, stream: T) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame.context("reading ipc frame")?;
        let request: IpcRequest = serde_json::from_slice(&frame).context("decoding ipc request")?;
        let response = balancer.process_message_from_application(request).await;
        let encoded = serde_json::to_vec(&response).context("encoding ipc response")?;
        framed.send(encoded.into()).await.context("writing ipc frame")?;
    }

    Ok(())
}
