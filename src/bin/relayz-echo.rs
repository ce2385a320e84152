use relayz::proto::Framing;
use relayz::tcp::Client;
use relayz::RelayError;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "relayz-echo")]
struct Opt {
    /// Broker host
    host: String,

    /// Broker port
    port: u16,

    #[structopt(long = "framing", default_value = "marker")]
    framing: Framing,
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let opt = Opt::from_args();
    let mut c = Client::new(&format!("{}:{}", opt.host, opt.port), opt.framing);
    c.run().await.map_err(|e| {
        log::error!("{}", e);
        e
    })
}
