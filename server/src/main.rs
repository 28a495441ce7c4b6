// SPDX-License-Identifier: MPL-2.0

use metadir_server::config::ServerConfig;
use metadir_server::logger;
use metadir_server::server::Server;

fn main() {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match ServerConfig::load(std::path::Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("load config {} fail: {}", path, err);
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    logger::init(config.log_level);
    let handle = match Server::start(config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("server start fail: {}", err);
            std::process::exit(1);
        }
    };

    log::info!(
        "metadir server listening on {} (service) / {} (cluster)",
        handle.service_addr(),
        handle.cluster_addr()
    );
    loop {
        std::thread::park();
    }
}
