use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::Instrument;
use crate::announcer::StopRx;

// Accepted connections travel to the controller with the handshake permit
// attached; the permit frees an accept slot when the handshake resolves.
pub type ConnTx = mpsc::UnboundedSender<(TcpStream, SocketAddr, OwnedSemaphorePermit)>;
pub type ConnRx = mpsc::UnboundedReceiver<(TcpStream, SocketAddr, OwnedSemaphorePermit)>;

pub struct Acceptor {

    listener: TcpListener,

    // Bounds concurrent handshake workers.
    handshakers: Arc<Semaphore>,

}

impl Acceptor {

    pub async fn bind(port: u16, max_accept: usize) -> std::io::Result<Acceptor> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Acceptor {
            listener,
            handshakers: Arc::new(Semaphore::new(max_accept)),
        })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn spawn(self, conn_tx: ConnTx, mut stop_rx: StopRx) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop { tokio::select! {

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("inbound connection error: {}", e);
                            continue;
                        },
                    };
                    // All handshake slots busy: drop the connection on the
                    // floor rather than queue it.
                    let permit = match Arc::clone(&self.handshakers).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::debug!("dropping inbound connection from {}", addr);
                            continue;
                        },
                    };
                    if conn_tx.send((stream, addr, permit)).is_err() {
                        return;
                    }
                }

                _ = stop_rx.recv() => return,

            }}
        }.instrument(tracing::info_span!("acceptor")))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use super::*;

    #[tokio::test]
    async fn test_accepts_up_to_limit() {
        let acceptor = Acceptor::bind(0, 2).await.unwrap();
        let port = acceptor.local_port().unwrap();
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = mpsc::unbounded_channel();
        acceptor.spawn(conn_tx, stop_rx);

        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        }

        // Two connections arrive holding permits, the third is dropped.
        let (_s1, _, _p1) = conn_rx.recv().await.unwrap();
        let (_s2, _, _p2) = conn_rx.recv().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(conn_rx.try_recv().is_err());

        for mut s in streams {
            let _ = s.shutdown().await;
        }
    }
}
