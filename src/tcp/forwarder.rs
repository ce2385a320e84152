use crate::error::{RelayError, Result};
use crate::proto::{Framing, Message, Payload};
use crate::Port;
use std::net::IpAddr;
use tokio::{io::AsyncWriteExt, net::TcpStream};

/// Delivers payloads to listener ports, one connection per payload.
#[derive(Clone)]
pub(crate) struct Forwarder {
    host: IpAddr,
    framing: Framing,
}

impl Forwarder {
    pub fn new(host: IpAddr, framing: Framing) -> Self {
        Self { host, framing }
    }

    /// Dial `destination` and write `content` addressed to `return_port`, so the
    /// far end can answer through the broker's reverse routing.
    pub async fn forward(&self, destination: Port, content: &[u8], return_port: Port) -> Result<()> {
        let fail = |source| RelayError::Forward {
            port: destination,
            source,
        };

        let mut stream = TcpStream::connect((self.host, destination.get()))
            .await
            .map_err(fail)?;

        let msg = Message::Payload(Payload::addressed(return_port, content.to_vec()));
        match self.framing.write_message(&mut stream, &msg).await {
            Ok(()) => {}
            Err(RelayError::Io(e)) => return Err(fail(e)),
            Err(e) => return Err(e),
        }
        stream.shutdown().await.map_err(fail)?;

        log::trace!(
            "forwarded {} bytes to {} (return {})",
            content.len(),
            destination,
            return_port
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forward_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = Port::from(listener.local_addr().unwrap());

        let f = Forwarder::new("127.0.0.1".parse().unwrap(), Framing::Marker);
        f.forward(dst, b"hello", Port::new(40000)).await.unwrap();

        let (mut s, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"40000:hello");
    }

    #[tokio::test]
    async fn test_forward_tagged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = Port::from(listener.local_addr().unwrap());

        let f = Forwarder::new("127.0.0.1".parse().unwrap(), Framing::Tagged);
        f.forward(dst, b"badefeedafed", Port::new(40000)).await.unwrap();

        let (mut s, _) = listener.accept().await.unwrap();
        let msg = Framing::Tagged.read_message(&mut s).await.unwrap();
        assert_eq!(
            msg,
            Some(Message::Payload(Payload::addressed(
                Port::new(40000),
                b"badefeedafed".to_vec()
            )))
        );
    }

    #[tokio::test]
    async fn test_forward_refused() {
        // bind and drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Port::from(l.local_addr().unwrap())
        };
        let f = Forwarder::new("127.0.0.1".parse().unwrap(), Framing::Marker);
        assert!(matches!(
            f.forward(port, b"x", Port::new(1)).await,
            Err(RelayError::Forward { .. })
        ));
    }
}
