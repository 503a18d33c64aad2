//! Listener front-ends.
//!
//! Accepts client connections over TCP or Unix domain sockets and runs
//! one [`Session`] per connection, all sharing the same
//! [`MessageHandler`].

use {
    crate::{
        handler::MessageHandler,
        io_err, res,
        session::Session,
        utils::{self, Result},
    },
    log::{error, info},
    std::{
        path::{Path, PathBuf},
        sync::{Arc, atomic::Ordering},
    },
    tokio::net::{TcpListener, UnixListener},
};

async fn serve_tcp<H>(handler: H, addr: &str) -> Result<()>
where
    H: MessageHandler + Clone + 'static,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let handler = handler.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = Session::new(handler, writehalf).run(readhalf).await;
            if let Err(e) = res {
                error!("session ended: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

pub async fn serve_unix<H>(handler: H, addr: impl AsRef<Path>) -> Result<()>
where
    H: MessageHandler + Clone + 'static,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            let res = Session::new(handler, writehalf).run(readhalf).await;
                            if let Err(e) = res {
                                error!("session ended: {:?}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Serve `handler` on a `proto!addr!port` address, where proto is
/// `tcp` or `unix`.
pub async fn serve<H>(handler: H, addr: &str) -> Result<()>
where
    H: MessageHandler + Clone + 'static,
{
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => serve_tcp(handler, &listen_addr).await,
        "unix" => serve_unix(handler, &listen_addr).await,
        _ => res!(io_err!(InvalidInput, "Protocol not supported")),
    }
}
