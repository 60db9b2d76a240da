#[global_allocator]
#[cfg(not(feature = "system_allocator"))]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{process::exit, sync::Arc};

use ilp_connector::config::Config;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("configuration error: {}", err);
            exit(1);
        }
    };

    if let Err(err) = simple_logger::init_with_level(config.log.level.as_level()) {
        eprintln!("logger init failed: {}", err);
        exit(2);
    }

    if let Err(err) = ilp_connector::server_main(config).await {
        log::error!("fatal: {}", err);
        exit(2);
    }
}
