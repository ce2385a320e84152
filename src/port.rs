use std::fmt;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::str::FromStr;

/// A tcp port number.
///
/// Ports travel as decimal strings on the marker wire format and as
/// `uint32` fields in tagged frames; inside the broker they are always typed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(u16);

impl Port {
    pub const fn new(port: u16) -> Self {
        Port(port)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// Narrow a protobuf `uint32` field, `None` if it is not a valid port.
    pub fn from_u32(port: u32) -> Option<Self> {
        u16::try_from(port).ok().map(Port)
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Port(port)
    }
}

impl From<SocketAddr> for Port {
    fn from(addr: SocketAddr) -> Self {
        Port(addr.port())
    }
}

impl FromStr for Port {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u16>().map(Port)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::Port;

    #[test]
    fn test_parse() {
        assert_eq!("54321".parse::<Port>().unwrap(), Port::new(54321));
        assert_eq!(" 80\n".parse::<Port>().unwrap(), Port::new(80));
        assert!("65536".parse::<Port>().is_err());
        assert!("abc".parse::<Port>().is_err());
        assert_eq!(Port::new(8080).to_string(), "8080");
    }

    #[test]
    fn test_from_u32() {
        assert_eq!(Port::from_u32(443), Some(Port::new(443)));
        assert_eq!(Port::from_u32(70000), None);
    }
}
