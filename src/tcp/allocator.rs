use crate::error::{RelayError, Result};
use crate::Port;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Error, ErrorKind::Other};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc::Sender, oneshot},
    task::{spawn, JoinHandle},
    time::timeout,
};

/// A connection accepted on one of the broker's listeners.
pub(crate) struct Accepted {
    pub stream: TcpStream,
    pub local: Port,
    pub peer: SocketAddr,
}

/// Hands out ephemeral listening ports.
///
/// Every allocated listener keeps accepting in the background and passes its
/// connections to the server through `accepted`.
#[derive(Clone)]
pub(crate) struct PortAllocator {
    bind_ip: IpAddr,
    deadline: Duration,
    accepted: Sender<Accepted>,
}

impl PortAllocator {
    pub fn new(bind_ip: IpAddr, deadline: Duration, accepted: Sender<Accepted>) -> Self {
        Self {
            bind_ip,
            deadline,
            accepted,
        }
    }

    pub async fn allocate(&self) -> Result<Port> {
        let (port_tx, port_rx) = oneshot::channel();
        let task = spawn(Self::listen(self.bind_ip, port_tx, self.accepted.clone()));
        Self::await_port(self.deadline, task, port_rx).await
    }

    /// Wait for the listener task to report its port. The task is aborted, and
    /// its listener closed, if nothing arrives before `deadline`.
    async fn await_port(
        deadline: Duration,
        task: JoinHandle<()>,
        port_rx: oneshot::Receiver<io::Result<Port>>,
    ) -> Result<Port> {
        match timeout(deadline, port_rx).await {
            Ok(Ok(Ok(port))) => Ok(port),
            Ok(Ok(Err(e))) => Err(RelayError::NoFreePort(e)),
            Ok(Err(_)) => Err(RelayError::NoFreePort(Error::new(
                Other,
                "listener task exited",
            ))),
            Err(_) => {
                task.abort();
                Err(RelayError::AllocationTimeout(deadline))
            }
        }
    }

    async fn listen(
        bind_ip: IpAddr,
        port_tx: oneshot::Sender<io::Result<Port>>,
        accepted: Sender<Accepted>,
    ) {
        let listener = match TcpListener::bind((bind_ip, 0)).await {
            Ok(l) => l,
            Err(e) => {
                let _ = port_tx.send(Err(e));
                return;
            }
        };
        let local = match listener.local_addr() {
            Ok(addr) => Port::from(addr),
            Err(e) => {
                let _ = port_tx.send(Err(e));
                return;
            }
        };

        if port_tx.send(Ok(local)).is_err() {
            return;
        }
        log::info!("listening on relay port {}", local);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let accepted_conn = Accepted {
                        stream,
                        local,
                        peer,
                    };
                    if accepted.send(accepted_conn).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("accept on relay port {} failed: {}", local, e);
                    break;
                }
            }
        }

        log::debug!("relay port {} closed", local);
    }

    /// Find a free port number without holding it.
    ///
    /// The socket is released before returning, so the number is only advisory:
    /// another process may bind it first and the caller has to cope with that.
    pub fn lease_port_number(&self) -> Result<Port> {
        let addr = SocketAddr::new(self.bind_ip, 0);
        let s = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(RelayError::NoFreePort)?;
        s.set_reuse_address(true).map_err(RelayError::NoFreePort)?;
        s.bind(&addr.into()).map_err(RelayError::NoFreePort)?;

        s.local_addr()
            .map_err(RelayError::NoFreePort)?
            .as_socket()
            .map(Port::from)
            .ok_or_else(|| RelayError::NoFreePort(Error::new(Other, "not an inet address")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::time::Instant;
    use tokio::sync::mpsc::channel;
    use tokio::time::sleep;

    fn allocator(deadline: Duration) -> (PortAllocator, tokio::sync::mpsc::Receiver<Accepted>) {
        let (tx, rx) = channel(10);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        (PortAllocator::new(ip, deadline, tx), rx)
    }

    #[tokio::test]
    async fn test_allocate_accepts() {
        let (a, mut rx) = allocator(Duration::from_secs(1));
        let port = a.allocate().await.unwrap();

        let s = TcpStream::connect(("127.0.0.1", port.get())).await.unwrap();
        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.local, port);
        assert_eq!(conn.peer, s.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_allocate_distinct() {
        let (a, _rx) = allocator(Duration::from_secs(1));
        let p1 = a.allocate().await.unwrap();
        let p2 = a.allocate().await.unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn test_timeout_closes_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (port_tx, port_rx) = oneshot::channel::<io::Result<Port>>();
        let task = spawn(async move {
            let _held = (listener, port_tx);
            pending::<()>().await
        });

        let start = Instant::now();
        let r = PortAllocator::await_port(Duration::from_millis(50), task, port_rx).await;
        assert!(matches!(r, Err(RelayError::AllocationTimeout(_))));
        assert!(start.elapsed() < Duration::from_millis(500));

        sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let (tx, _rx) = channel(1);
        // TEST-NET-1, never assigned to a local interface
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let a = PortAllocator::new(ip, Duration::from_secs(1), tx);
        assert!(matches!(
            a.allocate().await,
            Err(RelayError::NoFreePort(_))
        ));
        assert!(matches!(a.lease_port_number(), Err(RelayError::NoFreePort(_))));
    }

    #[test]
    fn test_lease_is_released() {
        let (tx, _rx) = channel(1);
        let a = PortAllocator::new("127.0.0.1".parse().unwrap(), Duration::from_secs(1), tx);
        let port = a.lease_port_number().unwrap();
        assert_ne!(port.get(), 0);
        std::net::TcpListener::bind(("127.0.0.1", port.get())).unwrap();
    }
}
