use anyhow::Result;

use lockgate::config::Config;
use lockgate::core::runtime;
use lockgate::util::logging;

fn main() -> Result<()> {
    logging::init();

    let config = match Config::parse(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    runtime::run(config)
}
