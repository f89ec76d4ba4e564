use clap::Parser;
use proctree_server::app::{self, Cli};

#[tokio::main]
async fn main() {
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("PROCTREE_LOG", "info"))
        .format_timestamp(None)
        .init();

    let res = app::run(Cli::parse()).await;
    if let Err(err) = res {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
