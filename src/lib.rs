//!A small rendezvous broker that lets an application behind NAT expose a reachable endpoint.
//!
//!The application only needs outbound connectivity. It dials the broker and registers; the broker
//!opens an ephemeral relay port on its behalf and routes whatever clients send to that port back
//!to the application.
//!
//!## How relayz works
//!1. The application connects to the broker and sends a registration request. The broker
//!   allocates a relay port and replies with its number.
//!2. On a connection to the relay port the application asks for a listener port. The broker hands
//!   out a free port number and remembers it as the relay's listener.
//!3. A client connects to the relay port and sends a payload. The broker opens a connection to the
//!   listener port and writes the payload prefixed with the client's port, its return address.
//!4. The application answers by sending `"<return port>:<reply>"` to the broker, which writes
//!   `<reply>` to the client connection with that port.
//!
//!Payloads nobody can route are answered with `"Unroutable:" + payload`.
//!
//!## Wire format
//!The default framing scans raw reads for two markers, see [`proto`]. A length-prefixed protobuf
//!framing that never looks inside payloads can be selected with [`proto::Framing::Tagged`].
//!
//!## Feature flags
//!- `server`: the broker, [`tcp::Server`]
//!- `client`: the echo application, [`tcp::Client`]

pub mod error;
pub mod proto;
pub mod tcp;

mod port;
pub use error::RelayError;
pub use port::Port;
