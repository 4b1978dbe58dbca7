//! A rule-based proxy router
//!
//! switchyardd forwards the connections accepted on its inbounds through the
//! outbounds chosen by the route rules of the switchyard crate.
//!
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::*;

use switchyard as sy;

#[derive(Parser, Debug)]
#[command(name = "switchyardd", version, about)]
struct Opt {
    #[arg(short = 'c', long = "config")]
    /// Set path to configuration file (format: yaml)
    config: PathBuf,
}

fn set_handler(signals: &[i32], handler: impl Fn(i32) + Send + 'static) -> io::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new(signals)?;
    std::thread::spawn(move || signals.forever().for_each(handler));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use signal_hook::consts::*;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();
    debug!("option: {:?}", opt);

    let config = sy::Config::with_file(&opt.config)
        .with_context(|| format!("load config {}", opt.config.display()))?;

    let (mut server, tx) = sy::Server::new(config).context("server config")?;
    set_handler(&[SIGTERM, SIGINT, SIGQUIT], move |signal| {
        info!("signal {} received", signal);
        tx.send(sy::ServerCommand::Terminate).ok();
    })
    .context("setting signal handler")?;

    server.serve().await.context("server error")?;
    Ok(())
}
