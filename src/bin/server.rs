use clap::Parser;
use resplite::config::Config;
use resplite::{server, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();

    server::run(config).await
}
