use super::allocator::{Accepted, PortAllocator};
use super::forwarder::Forwarder;
use super::routes::{Destination, RouteEntry, RouteTable};
use crate::error::{RelayError, Result as RelayResult};
use crate::proto::{Framing, Message, Payload, Reply};
use crate::Port;
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    select,
    sync::mpsc::{channel, Receiver, Sender},
    task,
};

const NO_RELAY_PORTS: &str = "Error - no free relay ports";
const NO_PORTS: &str = "Error - no free ports";

/// How a listener request obtains its port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ListenerMode {
    /// Hand out a free port number without listening on it. The application
    /// binds it itself.
    #[default]
    Lease,
    /// Listen on the port inside the broker, like a relay port. The
    /// application connects to it and forwarded payloads are handed to that
    /// connection.
    Allocate,
}

impl FromStr for ListenerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "lease" => Ok(ListenerMode::Lease),
            "allocate" => Ok(ListenerMode::Allocate),
            _ => Err(format!("unknown listener mode {:?}, expected lease or allocate", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub framing: Framing,
    pub listener_mode: ListenerMode,
    pub allocation_timeout: Duration,
    /// Address allocated relay and listener ports bind to.
    pub bind_ip: IpAddr,
    /// Host the forwarder dials listener ports on.
    pub forward_host: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::UNSPECIFIED, 8080).into(),
            framing: Framing::Marker,
            listener_mode: ListenerMode::Lease,
            allocation_timeout: Duration::from_secs(1),
            bind_ip: Ipv4Addr::UNSPECIFIED.into(),
            forward_host: Ipv4Addr::LOCALHOST.into(),
        }
    }
}

/// Tcp relay broker
///
/// accepts application registrations, hands out relay and listener ports,
/// and routes payloads between them.
pub struct Server {
    listener: TcpListener,
    port: Port,
    broker: Broker,
    accepted_rx: Receiver<Accepted>,
    count: u64,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let port = Port::from(listener.local_addr()?);
        let (accepted_tx, accepted_rx) = channel(64);

        let broker = Broker {
            routes: Default::default(),
            allocator: PortAllocator::new(
                config.bind_ip,
                config.allocation_timeout,
                accepted_tx,
            ),
            forwarder: Forwarder::new(config.forward_host, config.framing),
            framing: config.framing,
            listener_mode: config.listener_mode,
        };

        Ok(Self {
            listener,
            port,
            broker,
            accepted_rx,
            count: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn next_id(&mut self) -> u64 {
        self.count += 1;
        self.count
    }

    pub async fn run(mut self) -> Result<()> {
        log::info!("broker listening on {}", self.listener.local_addr()?);

        loop {
            let conn = select! {
                r = self.listener.accept() => match r {
                    Ok((stream, peer)) => Accepted { stream, local: self.port, peer },
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                },
                Some(conn) = self.accepted_rx.recv() => conn,
            };

            let id = self.next_id();
            let broker = self.broker.clone();
            task::spawn(async move {
                let Accepted {
                    stream,
                    local,
                    peer,
                } = conn;
                let (tx, rx) = channel(32);
                let (r, w) = stream.into_split();
                let h = ConnHandler {
                    broker,
                    id,
                    local,
                    remote: Port::from(peer),
                    tx,
                };

                h.handle_stream(r, w, rx).await;
            });
        }
    }
}

/// State shared by every connection task.
#[derive(Clone)]
struct Broker {
    routes: RouteTable,
    allocator: PortAllocator,
    forwarder: Forwarder,
    framing: Framing,
    listener_mode: ListenerMode,
}

/// How a connection task ended.
enum Ended {
    Reader(RelayResult<()>),
    Writer(RelayResult<()>),
}

struct ConnHandler {
    broker: Broker,
    id: u64,
    local: Port,
    remote: Port,
    tx: Sender<Reply>,
}

impl ConnHandler {
    async fn handle_stream(
        self,
        r: OwnedReadHalf,
        mut w: OwnedWriteHalf,
        mut rx: Receiver<Reply>,
    ) {
        let (id, local, remote) = (self.id, self.local, self.remote);
        log::debug!("conn {} open, local {} remote {}", id, local, remote);

        let routes = self.broker.routes.clone();
        let entry = RouteEntry {
            id,
            tx: self.tx.clone(),
        };
        routes.add_route(remote, entry.clone());
        if routes.attach(local, entry) {
            log::info!("conn {} ({}) attached to listener {}", id, remote, local);
        }

        let framing = self.broker.framing;
        let writer = Self::write_replies(framing, &mut w, &mut rx);
        tokio::pin!(writer);

        let ended = select! {
            r = self.read_msgs(r) => Ended::Reader(r),
            r = &mut writer => Ended::Writer(r),
        };

        routes.remove_route(remote, id);
        routes.detach(local, id);

        let res = match ended {
            // peer stopped sending; once the last sender is gone the writer
            // drains the queue and returns
            Ended::Reader(Ok(())) => {
                drop(self);
                writer.await
            }
            Ended::Reader(Err(e)) | Ended::Writer(Err(e)) => Err(e),
            Ended::Writer(Ok(())) => Ok(()),
        };
        match res {
            Ok(()) => log::debug!("conn {} closed", id),
            Err(e) => log::warn!("conn {} ({}): {}", id, remote, e),
        }
    }

    async fn read_msgs(&self, mut r: OwnedReadHalf) -> RelayResult<()> {
        loop {
            let msg = match self.broker.framing.read_message(&mut r).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(RelayError::MalformedRequest(reason)) => {
                    log::debug!("conn {} malformed request: {}", self.id, reason);
                    self.reply(Reply::Failure(format!("Error - malformed request: {}", reason)))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match msg {
                Message::RegisterRelay => self.handle_register().await?,
                Message::RequestListener => self.handle_listen().await?,
                Message::Payload(payload) => self.handle_payload(payload).await?,
            }
        }
    }

    async fn write_replies(
        framing: Framing,
        w: &mut OwnedWriteHalf,
        rx: &mut Receiver<Reply>,
    ) -> RelayResult<()> {
        while let Some(reply) = rx.recv().await {
            framing.write_reply(w, &reply).await?;
        }
        Ok(())
    }

    async fn reply(&self, reply: Reply) -> RelayResult<()> {
        self.tx
            .send(reply)
            .await
            .map_err(|_| RelayError::MissingRoute(self.remote))
    }

    async fn handle_register(&self) -> RelayResult<()> {
        let routes = &self.broker.routes;
        let reply = match self.broker.allocator.allocate().await {
            Ok(port) if routes.insert_relay(port, self.remote) => {
                log::info!("relay port {} registered for {}", port, self.remote);
                Reply::Relay(port)
            }
            Ok(port) => {
                log::warn!("relay port {} already registered", port);
                Reply::Failure(NO_RELAY_PORTS.into())
            }
            Err(e) => {
                log::warn!("relay allocation for {} failed: {}", self.remote, e);
                Reply::Failure(NO_RELAY_PORTS.into())
            }
        };
        self.reply(reply).await
    }

    async fn handle_listen(&self) -> RelayResult<()> {
        let allocator = &self.broker.allocator;
        if self.broker.routes.relay_owner(self.local).is_none() {
            log::debug!("listener requested on {}, which is not a relay port", self.local);
        }
        let port = match self.broker.listener_mode {
            ListenerMode::Lease => allocator.lease_port_number(),
            ListenerMode::Allocate => allocator.allocate().await.map(|port| {
                self.broker.routes.host_listener(port);
                port
            }),
        };

        let reply = match port {
            Ok(port) => {
                if let Some(old) = self
                    .broker
                    .routes
                    .insert_listener(self.local, port, self.remote)
                {
                    log::debug!("listener {} on relay {} replaced", old, self.local);
                }
                log::info!("listener port {} for relay {}", port, self.local);
                Reply::Listener(port)
            }
            Err(e) => {
                log::warn!("listener allocation for {} failed: {}", self.remote, e);
                Reply::Failure(NO_PORTS.into())
            }
        };
        self.reply(reply).await
    }

    async fn handle_payload(&self, payload: Payload) -> RelayResult<()> {
        let routes = &self.broker.routes;
        log::trace!(
            "conn {} payload {:?}",
            self.id,
            String::from_utf8_lossy(&payload.content())
        );

        if let Some(route) = routes.resolve_forward(self.local, self.remote) {
            log::debug!(
                "forwarding {} -> {} (return {})",
                self.local,
                route.destination,
                route.return_port
            );
            let content = payload.content();
            let forwarded = match routes.destination(route.destination) {
                Destination::Dial => {
                    self.broker
                        .forwarder
                        .forward(route.destination, &content, route.return_port)
                        .await
                }
                Destination::Attached(entry) => {
                    log::debug!("handing payload to conn {} on {}", entry.id, route.destination);
                    let payload = Payload::addressed(route.return_port, content.into_owned());
                    entry
                        .tx
                        .send(Reply::Forward(payload))
                        .await
                        .map_err(|_| RelayError::MissingRoute(route.destination))
                }
                Destination::Detached => Err(RelayError::MissingRoute(route.destination)),
            };
            return match forwarded {
                Ok(()) => Ok(()),
                Err(e) => {
                    log::warn!("{}", e);
                    self.reply(Reply::Failure(format!(
                        "Error - forward to {} failed",
                        route.destination
                    )))
                    .await
                }
            };
        }

        if let Some(port) = payload.return_port() {
            match self.deliver(port, payload.data().to_vec()).await {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("reverse route: {}", e),
            }
        }

        if let Some(port) = routes.return_port(self.local) {
            match self.deliver(port, payload.content().into_owned()).await {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("return route: {}", e),
            }
        }

        log::debug!("conn {} payload unroutable", self.id);
        self.reply(Reply::Unroutable(payload.content().into_owned()))
            .await
    }

    /// Queue `data` on the live connection whose remote port is `port`.
    async fn deliver(&self, port: Port, data: Vec<u8>) -> RelayResult<()> {
        let entry = self
            .broker
            .routes
            .route(port)
            .ok_or(RelayError::MissingRoute(port))?;

        log::debug!("delivering {} bytes to {} (conn {})", data.len(), port, entry.id);
        entry
            .tx
            .send(Reply::Delivery(data))
            .await
            .map_err(|_| RelayError::MissingRoute(port))
    }
}
