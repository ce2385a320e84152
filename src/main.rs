use relayz::proto::Framing;
use relayz::tcp::{ListenerMode, Server, ServerConfig};
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "relayz")]
struct Opt {
    /// Broker listen port
    #[structopt(default_value = "8080")]
    port: u16,

    /// Wire framing, marker or tagged
    #[structopt(long = "framing", default_value = "marker")]
    framing: Framing,

    /// How listener ports are handed out, lease or allocate
    #[structopt(long = "listener-mode", default_value = "lease")]
    listener_mode: ListenerMode,

    #[structopt(long = "allocation-timeout-ms", default_value = "1000")]
    allocation_timeout_ms: u64,

    /// Address relay ports bind to
    #[structopt(long = "bind-ip", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Host listener ports are dialed on
    #[structopt(long = "forward-host", default_value = "127.0.0.1")]
    forward_host: IpAddr,
}

impl From<Opt> for ServerConfig {
    fn from(opt: Opt) -> Self {
        ServerConfig {
            listen_addr: (Ipv4Addr::UNSPECIFIED, opt.port).into(),
            framing: opt.framing,
            listener_mode: opt.listener_mode,
            allocation_timeout: Duration::from_millis(opt.allocation_timeout_ms),
            bind_ip: opt.bind_ip,
            forward_host: opt.forward_host,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let opt = Opt::from_args();
    let s = Server::new(opt.into()).await.map_err(|e| {
        log::error!("failed to listen: {}", e);
        e
    })?;
    s.run().await
}
