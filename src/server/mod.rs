// src/server/mod.rs

//! Token-addressed rendezvous point for worker I/O.
//!
//! One listening socket, one owner task. Every registry mutation goes through
//! the owner's command channel; per-connection I/O runs in its own task so a
//! slow worker never stalls the owner.

mod address;

pub use address::{ServerAddress, TOKEN_LEN, random_token};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{QaError, Result};
use crate::protocol::{Visitor, decode};

/// Resolves once the registered connection has been fully served.
pub type Completion = oneshot::Receiver<Result<()>>;

/// Reason handed to visitors still waiting when the server shuts down.
pub const NO_LONGER_RUNNING: &str = "No longer running";

/// Pause before retrying after `accept` fails (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

enum Command {
    RegisterVisitor {
        visitor: Box<dyn Visitor>,
        done: oneshot::Sender<Result<()>>,
        reply: oneshot::Sender<ServerAddress>,
    },
    ExposeQueue {
        queue: mpsc::Receiver<String>,
        done: oneshot::Sender<Result<()>>,
        reply: oneshot::Sender<ServerAddress>,
    },
    Cancel {
        token: String,
    },
    Accepted {
        token: String,
        stream: BufReader<TcpStream>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle onto the running server.
#[derive(Debug, Clone)]
pub struct Server {
    tx: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind an ephemeral loopback port.
    pub async fn bind_loopback() -> Result<Self> {
        Self::listen(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    pub async fn listen(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let acceptor = tokio::spawn(accept_loop(listener, tx.clone()));
        let owner = Owner {
            local_addr,
            visitors: HashMap::new(),
            queues: HashMap::new(),
            acceptor,
        };
        tokio::spawn(owner.run(rx));

        info!(addr = %local_addr, "coordination server listening");
        Ok(Self { tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a visitor; the worker that dials in with the returned
    /// address streams its events into it.
    pub async fn decode(&self, visitor: Box<dyn Visitor>) -> Result<(ServerAddress, Completion)> {
        let (done, completion) = oneshot::channel();
        let (reply, address) = oneshot::channel();
        self.send(Command::RegisterVisitor {
            visitor,
            done,
            reply,
        })?;
        let address = address.await.map_err(|_| QaError::ServerNotRunning)?;
        Ok((address, completion))
    }

    /// Register an outbound queue; the worker that dials in receives every
    /// line sent on the queue until it is closed.
    pub async fn expose(&self, queue: mpsc::Receiver<String>) -> Result<(ServerAddress, Completion)> {
        let (done, completion) = oneshot::channel();
        let (reply, address) = oneshot::channel();
        self.send(Command::ExposeQueue { queue, done, reply })?;
        let address = address.await.map_err(|_| QaError::ServerNotRunning)?;
        Ok((address, completion))
    }

    /// Retire a registration that no worker has claimed yet.
    pub fn cancel(&self, address: &ServerAddress) -> Result<()> {
        self.send(Command::Cancel {
            token: address.token.clone(),
        })
    }

    /// Stop accepting connections and end every pending registration.
    /// Connections already handed off keep running.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(Command::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| QaError::ServerNotRunning)
    }
}

struct PendingVisitor {
    visitor: Box<dyn Visitor>,
    done: oneshot::Sender<Result<()>>,
}

struct PendingQueue {
    queue: mpsc::Receiver<String>,
    done: oneshot::Sender<Result<()>>,
}

struct Owner {
    local_addr: SocketAddr,
    visitors: HashMap<String, PendingVisitor>,
    queues: HashMap<String, PendingQueue>,
    acceptor: JoinHandle<()>,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::RegisterVisitor {
                    visitor,
                    done,
                    reply,
                } => {
                    let token = self.fresh_token();
                    self.visitors
                        .insert(token.clone(), PendingVisitor { visitor, done });
                    let _ = reply.send(self.address(token));
                }
                Command::ExposeQueue { queue, done, reply } => {
                    let token = self.fresh_token();
                    self.queues.insert(token.clone(), PendingQueue { queue, done });
                    let _ = reply.send(self.address(token));
                }
                Command::Cancel { token } => self.cancel(&token),
                Command::Accepted { token, stream } => self.hand_off(token, stream),
                Command::Shutdown { ack } => {
                    self.shutdown();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("coordination server owner loop finished");
    }

    fn fresh_token(&self) -> String {
        loop {
            let token = random_token(TOKEN_LEN);
            if !self.visitors.contains_key(&token) && !self.queues.contains_key(&token) {
                return token;
            }
        }
    }

    fn address(&self, token: String) -> ServerAddress {
        ServerAddress {
            token,
            addr: self.local_addr,
        }
    }

    fn hand_off(&mut self, token: String, stream: BufReader<TcpStream>) {
        if let Some(PendingVisitor { mut visitor, done }) = self.visitors.remove(&token) {
            debug!(%token, "streaming events into visitor");
            tokio::spawn(async move {
                let result = decode(stream, visitor.as_mut()).await;
                let _ = done.send(result);
            });
        } else if let Some(PendingQueue { queue, done }) = self.queues.remove(&token) {
            debug!(%token, "pumping request queue");
            tokio::spawn(async move {
                let result = pump(queue, stream.into_inner()).await;
                let _ = done.send(result);
            });
        } else {
            warn!(%token, "connection presented an unknown or spent token; dropping");
        }
    }

    fn cancel(&mut self, token: &str) {
        if let Some(PendingVisitor { mut visitor, done }) = self.visitors.remove(token) {
            let reason = QaError::Transport(format!("registration {token} canceled"));
            visitor.end(Some(&reason));
            let _ = done.send(Err(reason));
        } else if let Some(PendingQueue { done, .. }) = self.queues.remove(token) {
            let _ = done.send(Err(QaError::Transport(format!(
                "registration {token} canceled"
            ))));
        }
    }

    fn shutdown(&mut self) {
        self.acceptor.abort();
        let pending = self.visitors.len() + self.queues.len();
        for (_, PendingVisitor { mut visitor, done }) in self.visitors.drain() {
            let reason = QaError::ServerClosed(NO_LONGER_RUNNING.to_string());
            visitor.end(Some(&reason));
            let _ = done.send(Err(reason));
        }
        for (_, PendingQueue { done, .. }) in self.queues.drain() {
            let _ = done.send(Err(QaError::ServerClosed(NO_LONGER_RUNNING.to_string())));
        }
        info!(pending, "coordination server shut down");
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<Command>) {
    loop {
        let (socket, peer) = accept_next(|| listener.accept()).await;
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = BufReader::new(socket);
            let mut token = String::new();
            match stream.read_line(&mut token).await {
                Ok(0) => debug!(%peer, "connection closed before sending a token"),
                Ok(_) => {
                    let token = token.trim().to_string();
                    let _ = tx.send(Command::Accepted { token, stream });
                }
                Err(err) => warn!(%peer, error = %err, "failed to read token"),
            }
        });
    }
}

/// Retry `accept` until it yields a connection, backing off after each error.
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(err) => {
                warn!(error = %err, backoff = ?ACCEPT_ERROR_BACKOFF, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn pump(mut queue: mpsc::Receiver<String>, mut socket: TcpStream) -> Result<()> {
    while let Some(message) = queue.recv().await {
        socket.write_all(message.as_bytes()).await?;
        socket.write_all(b"\n").await?;
    }
    socket.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn accept_errors_back_off_before_retrying() {
        let mut attempts = 0;
        let started = Instant::now();

        let conn = accept_next(|| {
            attempts += 1;
            let result = if attempts < 3 {
                Err(io::Error::other("too many open files"))
            } else {
                Ok(attempts)
            };
            async move { result }
        })
        .await;

        assert_eq!(conn, 3);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF * 2);
    }
}
