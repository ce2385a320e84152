use crate::error::{RelayError, Result};
use crate::proto::{Framing, Message, Payload, Reply};
use crate::Port;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use tokio::{
    net::{lookup_host, tcp::OwnedWriteHalf, TcpListener, TcpSocket, TcpStream},
    task::spawn,
};

/// Echo application
///
/// registers with a broker, asks for a listener port and answers every
/// forwarded payload with `"echoed " + payload` through the broker.
pub struct Client {
    server_addr: String,
    framing: Framing,
    control: Option<OwnedWriteHalf>,
}

impl Client {
    pub fn new(server_addr: &str, framing: Framing) -> Self {
        Self {
            server_addr: server_addr.to_owned(),
            framing,
            control: None,
        }
    }

    async fn server_addr(&self) -> Result<SocketAddr> {
        lookup_host(self.server_addr.clone())
            .await?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::Other, "server name resolve fail").into())
    }

    async fn request(&self, s: &mut TcpStream, msg: &Message) -> Result<Reply> {
        self.framing.write_message(s, msg).await?;
        self.framing
            .read_reply(s)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::Other, "broker closed connection").into())
    }

    /// Register with the broker and return the relay port it assigned.
    ///
    /// The registration connection stays open as the control connection; echo
    /// replies go back over it.
    pub async fn register(&mut self) -> Result<Port> {
        let mut s = TcpStream::connect(self.server_addr().await?).await?;

        let port = match self.request(&mut s, &Message::RegisterRelay).await? {
            Reply::Relay(port) => port,
            Reply::Failure(reason) => return Err(Error::new(ErrorKind::Other, reason).into()),
            r => return Err(RelayError::MalformedRequest(format!("unexpected reply {:?}", r))),
        };
        log::info!("established relay port {}", port);

        let (mut r, w) = s.into_split();
        let framing = self.framing;
        spawn(async move {
            while let Ok(Some(reply)) = framing.read_reply(&mut r).await {
                log::info!("broker: {:?}", reply);
            }
        });
        self.control = Some(w);

        Ok(port)
    }

    /// Ask for a listener port on `relay`.
    pub async fn request_listener(&self, relay: Port) -> Result<(TcpStream, Port)> {
        let mut addr = self.server_addr().await?;
        addr.set_port(relay.get());
        let mut s = TcpStream::connect(addr).await?;

        match self.request(&mut s, &Message::RequestListener).await? {
            Reply::Listener(port) => {
                log::info!("received listener port {}", port);
                Ok((s, port))
            }
            Reply::Failure(reason) => Err(Error::new(ErrorKind::Other, reason).into()),
            r => Err(RelayError::MalformedRequest(format!("unexpected reply {:?}", r))),
        }
    }

    fn bind(port: Port) -> Result<TcpListener> {
        let s = TcpSocket::new_v4()?;
        s.set_reuseaddr(true)?;
        s.bind(([0, 0, 0, 0], port.get()).into())?;
        Ok(s.listen(16)?)
    }

    /// Accept forwarded payloads on `listen` and echo them back.
    ///
    /// A bad forwarded connection is logged and dropped; only a failure on the
    /// control connection ends the loop.
    pub async fn serve(&mut self, listen: Port) -> Result<()> {
        let listener = Self::bind(listen)?;
        log::info!("listening on {}", listen);

        loop {
            let (mut s, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
            };
            loop {
                match self.framing.read_message(&mut s).await {
                    Ok(Some(Message::Payload(payload))) => self.echo(payload).await?,
                    Ok(Some(m)) => log::debug!("ignoring {:?} from {}", m, addr),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("forwarded connection from {}: {}", addr, e);
                        break;
                    }
                }
            }
        }
    }

    /// Connect to a listener port the broker hosts itself and echo the
    /// payloads it hands over.
    pub async fn attach(&mut self, listen: Port) -> Result<()> {
        let mut addr = self.server_addr().await?;
        addr.set_port(listen.get());
        let mut s = TcpStream::connect(addr).await?;
        log::info!("attached to listener {}", listen);

        while let Some(reply) = self.framing.read_reply(&mut s).await? {
            match reply {
                Reply::Forward(payload) => self.echo(payload).await?,
                Reply::Delivery(data) => self.echo(Payload::from_marker_bytes(data)).await?,
                r => log::info!("broker: {:?}", r),
            }
        }
        Err(Error::new(ErrorKind::ConnectionAborted, "broker closed listener").into())
    }

    async fn echo(&mut self, payload: Payload) -> Result<()> {
        let return_port = match payload.return_port() {
            Some(port) => port,
            None => {
                log::debug!("payload without return port dropped");
                return Ok(());
            }
        };
        log::info!(
            "reading {}",
            String::from_utf8_lossy(payload.data())
        );

        let mut data = b"echoed ".to_vec();
        data.extend_from_slice(payload.data());
        let reply = Message::Payload(Payload::addressed(return_port, data));

        let w = self
            .control
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Other, "not registered"))?;
        self.framing.write_message(w, &reply).await
    }

    /// Register, request a listener on the relay port and echo forever.
    ///
    /// If the listener port is already taken, the broker is listening on it
    /// and the client attaches instead.
    pub async fn run(&mut self) -> Result<()> {
        let relay = self.register().await?;
        let (_listen_conn, listen) = self.request_listener(relay).await?;
        match self.serve(listen).await {
            Err(RelayError::Io(e)) if e.kind() == ErrorKind::AddrInUse => {
                self.attach(listen).await
            }
            r => r,
        }
    }
}
