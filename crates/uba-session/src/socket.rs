//! Unix domain socket listener for the session.
//!
//! Every frame is one request; the reply goes back as one frame on the same
//! connection. Requests from all connections are serialized on the handler.

use crate::SessionHandler;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uba_ipc::transport::async_frame::{read_frame, write_frame};

/// Bind `socket_path` and serve until the process exits.
pub async fn run_listener(socket_path: &Path, handler: SessionHandler) -> Result<()> {
    // Remove a stale socket left by a previous session
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "Listening for connections");

    serve(listener, Arc::new(Mutex::new(handler))).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: UnixListener, handler: Arc<Mutex<SessionHandler>>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, handler).await {
                        warn!(error = %e, "Client handler error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_client(mut stream: UnixStream, handler: Arc<Mutex<SessionHandler>>) -> Result<()> {
    debug!("New client connected");

    loop {
        let Some(request) = read_frame(&mut stream).await? else {
            debug!("Client disconnected");
            return Ok(());
        };

        let reply = {
            let mut h = handler.lock().await;
            h.handle_bytes(&request)
        };

        match reply {
            Ok(reply) => write_frame(&mut stream, &reply).await?,
            Err(e) => {
                // The client treats a missing reply as fatal, so drop it.
                warn!(error = %e, len = request.len(), "Failed to handle request, dropping client");
                return Ok(());
            }
        }
    }
}
