//! Broker wire messages.
//!
//! Two framings carry the same messages:
//!
//! - `Marker`: one read of up to [`MAX_MESSAGE`] bytes, scanned for the
//!   registration and listener markers anywhere in the buffer. Anything else is
//!   payload, optionally addressed with a `"<port>:"` prefix.
//! - `Tagged`: a big-endian `u16` length followed by a protobuf `Request` or
//!   `Response` (see `proto/relay.proto`). Payload bytes are never inspected.

include!(concat!(env!("OUT_DIR"), "/proto/mod.rs"));

use crate::error::{RelayError, Result};
use crate::Port;
use protobuf::Message as _;
use relay::{
    request, response, Delivery, Failure, Listen, Listener, Register, Relay, Request, Response,
    Unroutable,
};
use std::borrow::Cow;
use std::io::{Error, ErrorKind};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REGISTER_MARKER: &[u8] = b"deadbeaffade";
pub const LISTEN_MARKER: &[u8] = b"badefeedafed";

/// Largest single read (marker) or frame body (tagged).
pub const MAX_MESSAGE: usize = 2048;

/// Inbound message on a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RegisterRelay,
    RequestListener,
    Payload(Payload),
}

/// Application bytes, optionally addressed to a return port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    return_port: Option<Port>,
    data: Vec<u8>,
}

impl Payload {
    /// Payload as read off a marker connection. A leading `"<port>:"` is taken
    /// as a return address only if it is the canonical decimal form of a port,
    /// so [`Payload::content`] reproduces the input exactly.
    pub fn from_marker_bytes(buf: Vec<u8>) -> Self {
        let port = buf
            .iter()
            .position(|b| *b == b':')
            .and_then(|i| Some((i, std::str::from_utf8(&buf[..i]).ok()?)))
            .filter(|(_, s)| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|(i, s)| {
                let port = s.parse::<u16>().ok()?;
                (port.to_string() == s).then_some((i, Port::new(port)))
            });

        match port {
            Some((i, port)) => Self {
                return_port: Some(port),
                data: buf[i + 1..].to_vec(),
            },
            None => Self::new(buf),
        }
    }

    pub fn new(data: Vec<u8>) -> Self {
        Self {
            return_port: None,
            data,
        }
    }

    pub fn addressed(return_port: Port, data: Vec<u8>) -> Self {
        Self {
            return_port: Some(return_port),
            data,
        }
    }

    pub fn return_port(&self) -> Option<Port> {
        self.return_port
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The payload as the sender wrote it, return address included.
    pub fn content(&self) -> Cow<'_, [u8]> {
        match self.return_port {
            Some(port) => {
                let mut buf = format!("{}:", port).into_bytes();
                buf.extend_from_slice(&self.data);
                Cow::Owned(buf)
            }
            None => Cow::Borrowed(&self.data),
        }
    }
}

impl Message {
    pub fn from_marker_bytes(buf: Vec<u8>) -> Self {
        if contains(&buf, REGISTER_MARKER) {
            Message::RegisterRelay
        } else if contains(&buf, LISTEN_MARKER) {
            Message::RequestListener
        } else {
            Message::Payload(Payload::from_marker_bytes(buf))
        }
    }

    fn from_request(req: Request) -> Result<Self> {
        match req.cmd {
            Some(request::Cmd::Register(_)) => Ok(Message::RegisterRelay),
            Some(request::Cmd::Listen(_)) => Ok(Message::RequestListener),
            Some(request::Cmd::Payload(p)) => match p.return_port {
                0 => Ok(Message::Payload(Payload::new(p.data))),
                n => Port::from_u32(n)
                    .map(|port| Message::Payload(Payload::addressed(port, p.data)))
                    .ok_or_else(|| {
                        RelayError::MalformedRequest(format!("invalid return port {}", n))
                    }),
            },
            None => Err(RelayError::MalformedRequest("missing command".into())),
        }
    }

    fn to_request(&self) -> Request {
        let mut req = Request::new();
        req.cmd = Some(match self {
            Message::RegisterRelay => request::Cmd::Register(Register::new()),
            Message::RequestListener => request::Cmd::Listen(Listen::new()),
            Message::Payload(payload) => {
                let mut p = relay::Payload::new();
                p.return_port = payload.return_port.map_or(0, |port| port.get().into());
                p.data = payload.data.clone();
                request::Cmd::Payload(p)
            }
        });
        req
    }
}

/// Outbound message on a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Relay(Port),
    Listener(Port),
    Failure(String),
    Unroutable(Vec<u8>),
    Delivery(Vec<u8>),
    /// Addressed payload handed to an application attached on a listener
    /// port the broker hosts.
    Forward(Payload),
}

impl Reply {
    fn to_marker_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Relay(port) => format!(":{}\n", port).into_bytes(),
            Reply::Listener(port) => format!("Listen:{}\n", port).into_bytes(),
            Reply::Failure(reason) => format!("{}\n", reason).into_bytes(),
            Reply::Unroutable(data) => [b"Unroutable:".as_slice(), data.as_slice()].concat(),
            Reply::Delivery(data) => data.clone(),
            Reply::Forward(payload) => payload.content().into_owned(),
        }
    }

    fn from_marker_bytes(buf: Vec<u8>) -> Result<Self> {
        let port = |s: &[u8]| {
            String::from_utf8_lossy(s)
                .parse::<Port>()
                .map_err(|_| RelayError::MalformedRequest("invalid port in reply".into()))
        };

        if let Some(rest) = buf.strip_prefix(b"Listen:") {
            Ok(Reply::Listener(port(rest)?))
        } else if let Some(rest) = buf.strip_prefix(b"Unroutable:") {
            Ok(Reply::Unroutable(rest.to_vec()))
        } else if buf.starts_with(b"Error") {
            Ok(Reply::Failure(String::from_utf8_lossy(&buf).trim_end().to_string()))
        } else if let Some(rest) = buf.strip_prefix(b":") {
            Ok(Reply::Relay(port(rest)?))
        } else {
            Ok(Reply::Delivery(buf))
        }
    }

    fn to_response(&self) -> Response {
        let mut resp = Response::new();
        resp.cmd = Some(match self {
            Reply::Relay(port) => {
                let mut r = Relay::new();
                r.port = port.get().into();
                response::Cmd::Relay(r)
            }
            Reply::Listener(port) => {
                let mut l = Listener::new();
                l.port = port.get().into();
                response::Cmd::Listener(l)
            }
            Reply::Failure(reason) => {
                let mut f = Failure::new();
                f.reason = reason.clone();
                response::Cmd::Failure(f)
            }
            Reply::Unroutable(data) => {
                let mut u = Unroutable::new();
                u.data = data.clone();
                response::Cmd::Unroutable(u)
            }
            Reply::Delivery(data) => {
                let mut d = Delivery::new();
                d.data = data.clone();
                response::Cmd::Delivery(d)
            }
            Reply::Forward(payload) => {
                let mut p = relay::Payload::new();
                p.return_port = payload.return_port.map_or(0, |port| port.get().into());
                p.data = payload.data.clone();
                response::Cmd::Forward(p)
            }
        });
        resp
    }

    fn from_response(resp: Response) -> Result<Self> {
        let port = |n: u32| {
            Port::from_u32(n)
                .ok_or_else(|| RelayError::MalformedRequest(format!("invalid port {}", n)))
        };

        match resp.cmd {
            Some(response::Cmd::Relay(r)) => Ok(Reply::Relay(port(r.port)?)),
            Some(response::Cmd::Listener(l)) => Ok(Reply::Listener(port(l.port)?)),
            Some(response::Cmd::Failure(f)) => Ok(Reply::Failure(f.reason)),
            Some(response::Cmd::Unroutable(u)) => Ok(Reply::Unroutable(u.data)),
            Some(response::Cmd::Delivery(d)) => Ok(Reply::Delivery(d.data)),
            Some(response::Cmd::Forward(p)) => match p.return_port {
                0 => Ok(Reply::Forward(Payload::new(p.data))),
                n => Ok(Reply::Forward(Payload::addressed(port(n)?, p.data))),
            },
            None => Err(RelayError::MalformedRequest("missing reply".into())),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Marker,
    Tagged,
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "marker" => Ok(Framing::Marker),
            "tagged" => Ok(Framing::Tagged),
            _ => Err(format!("unknown framing {:?}, expected marker or tagged", s)),
        }
    }
}

impl Framing {
    /// Read the next message. `Ok(None)` means the peer closed the stream.
    ///
    /// A `MalformedRequest` error leaves the stream positioned at the next
    /// message, so the caller may keep reading.
    pub async fn read_message<R>(self, r: &mut R) -> Result<Option<Message>>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Framing::Marker => Ok(read_chunk(r).await?.map(Message::from_marker_bytes)),
            Framing::Tagged => match read_frame(r).await? {
                Some(buf) => {
                    let req = Request::parse_from_bytes(&buf).map_err(|e| {
                        RelayError::MalformedRequest(format!("failed to parse request: {}", e))
                    })?;
                    Message::from_request(req).map(Some)
                }
                None => Ok(None),
            },
        }
    }

    pub async fn write_message<W>(self, w: &mut W, msg: &Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Framing::Marker => {
                let buf = match msg {
                    Message::RegisterRelay => Cow::Borrowed(REGISTER_MARKER),
                    Message::RequestListener => Cow::Borrowed(LISTEN_MARKER),
                    Message::Payload(payload) => payload.content(),
                };
                w.write_all(&buf).await?;
            }
            Framing::Tagged => write_frame(w, &msg.to_request()).await?,
        }
        w.flush().await?;
        Ok(())
    }

    pub async fn read_reply<R>(self, r: &mut R) -> Result<Option<Reply>>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Framing::Marker => match read_chunk(r).await? {
                Some(buf) => Reply::from_marker_bytes(buf).map(Some),
                None => Ok(None),
            },
            Framing::Tagged => match read_frame(r).await? {
                Some(buf) => {
                    let resp = Response::parse_from_bytes(&buf).map_err(|e| {
                        RelayError::MalformedRequest(format!("failed to parse reply: {}", e))
                    })?;
                    Reply::from_response(resp).map(Some)
                }
                None => Ok(None),
            },
        }
    }

    pub async fn write_reply<W>(self, w: &mut W, reply: &Reply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Framing::Marker => w.write_all(&reply.to_marker_bytes()).await?,
            Framing::Tagged => write_frame(w, &reply.to_response()).await?,
        }
        w.flush().await?;
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

async fn read_chunk<R>(r: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; MAX_MESSAGE];
    let size = r.read(&mut buf).await?;
    if size == 0 {
        return Ok(None);
    }
    buf.truncate(size);
    Ok(Some(buf))
}

async fn read_frame<R>(r: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0; 2];
    match r.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u16::from_be_bytes(buf).into();
    let mut buf = vec![0; size];
    r.read_exact(&mut buf).await?;

    // The body is already drained, so the stream stays in sync.
    if size > MAX_MESSAGE {
        return Err(RelayError::MalformedRequest(format!(
            "message size {} exceeds {}",
            size, MAX_MESSAGE
        )));
    }

    Ok(Some(buf))
}

async fn write_frame<W, M>(w: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: protobuf::Message,
{
    let vec = msg
        .write_to_bytes()
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
    let size = u16::try_from(vec.len())
        .map_err(|_| Error::new(ErrorKind::InvalidData, "message too large"))?;

    w.write_all(&size.to_be_bytes()).await?;
    w.write_all(&vec).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_classify() {
        assert_eq!(
            Message::from_marker_bytes(b"xxdeadbeaffadexx".to_vec()),
            Message::RegisterRelay
        );
        assert_eq!(
            Message::from_marker_bytes(b"badefeedafed".to_vec()),
            Message::RequestListener
        );
        // registration wins when both markers are present
        assert_eq!(
            Message::from_marker_bytes(b"badefeedafed deadbeaffade".to_vec()),
            Message::RegisterRelay
        );
        assert_eq!(
            Message::from_marker_bytes(b"hello".to_vec()),
            Message::Payload(Payload::new(b"hello".to_vec()))
        );
    }

    #[test]
    fn test_marker_return_address() {
        let p = Payload::from_marker_bytes(b"54321:hello:world".to_vec());
        assert_eq!(p.return_port(), Some(Port::new(54321)));
        assert_eq!(p.data(), b"hello:world");
        assert_eq!(&*p.content(), b"54321:hello:world");

        for raw in [&b"007:x"[..], &b"99999:x"[..], &b":x"[..], &b"abc:x"[..], &b"no colon"[..]] {
            let p = Payload::from_marker_bytes(raw.to_vec());
            assert_eq!(p.return_port(), None, "{:?}", raw);
            assert_eq!(&*p.content(), raw);
        }
    }

    #[test]
    fn test_marker_replies() {
        assert_eq!(Reply::Relay(Port::new(54321)).to_marker_bytes(), b":54321\n");
        assert_eq!(
            Reply::Listener(Port::new(54322)).to_marker_bytes(),
            b"Listen:54322\n"
        );
        assert_eq!(
            Reply::Unroutable(b"hello".to_vec()).to_marker_bytes(),
            b"Unroutable:hello"
        );
        assert_eq!(
            Reply::from_marker_bytes(b"Listen:54322\n".to_vec()).unwrap(),
            Reply::Listener(Port::new(54322))
        );
        assert_eq!(
            Reply::from_marker_bytes(b"Error - no free ports\n".to_vec()).unwrap(),
            Reply::Failure("Error - no free ports".into())
        );
    }

    #[tokio::test]
    async fn test_tagged_payload_keeps_markers() {
        let msg = Message::Payload(Payload::addressed(Port::new(9), b"deadbeaffade".to_vec()));
        let mut buf = Vec::new();
        Framing::Tagged.write_message(&mut buf, &msg).await.unwrap();

        let mut r = buf.as_slice();
        let read = Framing::Tagged.read_message(&mut r).await.unwrap();
        assert_eq!(read, Some(msg));
        assert_eq!(Framing::Tagged.read_message(&mut r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tagged_oversize_frame_is_skipped() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE + 1) as u16).to_be_bytes());
        buf.extend(std::iter::repeat(0u8).take(MAX_MESSAGE + 1));
        Framing::Tagged
            .write_message(&mut buf, &Message::RequestListener)
            .await
            .unwrap();

        let mut r = buf.as_slice();
        assert!(matches!(
            Framing::Tagged.read_message(&mut r).await,
            Err(RelayError::MalformedRequest(_))
        ));
        assert_eq!(
            Framing::Tagged.read_message(&mut r).await.unwrap(),
            Some(Message::RequestListener)
        );
    }

    #[tokio::test]
    async fn test_tagged_garbage_is_malformed() {
        let mut r: &[u8] = &[0, 3, 0xff, 0xff, 0xff];
        assert!(matches!(
            Framing::Tagged.read_message(&mut r).await,
            Err(RelayError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_tagged_reply() {
        let mut buf = Vec::new();
        let reply = Reply::Unroutable(b"hello".to_vec());
        Framing::Tagged.write_reply(&mut buf, &reply).await.unwrap();
        let mut r = buf.as_slice();
        assert_eq!(Framing::Tagged.read_reply(&mut r).await.unwrap(), Some(reply));
    }

    #[tokio::test]
    async fn test_forward_reply() {
        let payload = Payload::addressed(Port::new(40001), b"hello".to_vec());
        assert_eq!(
            Reply::Forward(payload.clone()).to_marker_bytes(),
            b"40001:hello"
        );

        let mut buf = Vec::new();
        let reply = Reply::Forward(payload);
        Framing::Tagged.write_reply(&mut buf, &reply).await.unwrap();
        let mut r = buf.as_slice();
        assert_eq!(Framing::Tagged.read_reply(&mut r).await.unwrap(), Some(reply));
    }
}
