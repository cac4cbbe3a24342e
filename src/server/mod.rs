//! Serving a file tree to remote clients.
//!
//! [`Server`] pairs a [`Node`] tree with a transport. Every connection gets
//! its own [`Session`] and a sequential request loop: read one request,
//! answer it, repeat until the client hangs up. Request errors become
//! `Rerror` replies; only transport failures end the loop.

pub mod node;
pub mod tree;

mod session;

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::proto::{read_message, write_message, Tmsg, DEFAULT_MSIZE, MIN_MSIZE};

pub use node::Node;
pub use tree::{MemDir, MemFile, QidAllocator};

use session::Session;

/// Tunables for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest message size offered during version negotiation. Clients
    /// proposing less get their own value; more gets clamped to this.
    pub msize: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            msize: DEFAULT_MSIZE,
        }
    }
}

/// Serves one file tree to any number of clients.
pub struct Server {
    root: Arc<dyn Node>,
    config: ServerConfig,
}

impl Server {
    pub fn new(root: Arc<dyn Node>) -> Server {
        Server::with_config(root, ServerConfig::default())
    }

    pub fn with_config(root: Arc<dyn Node>, mut config: ServerConfig) -> Server {
        config.msize = config.msize.max(MIN_MSIZE);
        Server { root, config }
    }

    /// Accept connections forever, one task per client.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "client connected");
            let server = self.clone();
            tokio::spawn(async move {
                match server.handle(stream).await {
                    Ok(()) => info!(%peer, "client disconnected"),
                    Err(e) => warn!(%peer, error = %e, "session ended abnormally"),
                }
            });
        }
    }

    /// Drive one client over any byte stream until it disconnects.
    ///
    /// Usable directly for transports other than TCP: pipes, in-process
    /// duplex streams, or anything else that reads and writes bytes.
    pub async fn handle<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session::new(self.root.clone(), self.config.msize);
        loop {
            let (tag, msg) = match read_message::<_, Tmsg>(&mut stream, session.msize()).await {
                Ok(frame) => frame,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("end of stream");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let reply = session.dispatch(tag, msg).await;
            write_message(&mut stream, tag, &reply).await?;
        }
    }
}
