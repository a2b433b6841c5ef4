//! The cache server binary: parse CLI flags, recover (or create) a
//! cache instance, start the background threads, and serve RPCs until
//! killed (§6, §7).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{App, Arg};

use vesta_cache::config::Config;
use vesta_cache::pipeline::Pipeline;
use vesta_cache::server::CacheServer;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("cached")
        .about("Function-call cache server")
        .arg(
            Arg::with_name("base-dir")
                .long("base-dir")
                .value_name("DIR")
                .help("Root directory for the stable store and logs")
                .takes_value(true)
                .default_value("."),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("vesta.cfg-style config file, overlaid onto the defaults")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("Overrides the listen port from the config file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fresh")
                .long("fresh")
                .help("Create a new installation instead of recovering an existing one"),
        )
        .get_matches();

    let base_dir = PathBuf::from(matches.value_of("base-dir").unwrap());
    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(&base_dir, &PathBuf::from(path))?,
        None => Config::defaults_under(&base_dir),
    };
    if let Some(port) = matches.value_of("port") {
        config.listen_port = port.parse()?;
    }

    log::info!(
        "starting cache server: scache_dir={} metadata_dir={}",
        config.scache_dir.display(),
        config.metadata_dir.display()
    );

    let pipeline = if matches.is_present("fresh") {
        Pipeline::open(config.clone())?
    } else {
        Pipeline::recover(config.clone())?
    };
    let pipeline = Arc::new(pipeline);

    let _expiry_handle = pipeline.leases.spawn_expiry_thread(config.lease_timeout / 4);

    let checkpoint_pipeline = Arc::clone(&pipeline);
    let checkpoint_interval = config.checkpoint_interval;
    std::thread::Builder::new()
        .name("periodic-checkpoint".to_string())
        .spawn(move || loop {
            std::thread::sleep(checkpoint_interval);
            if let Err(e) = checkpoint_pipeline.checkpoint(&[], false) {
                log::warn!("periodic checkpoint failed: {}", e);
            }
        })?;

    let server = CacheServer::new(&config, pipeline)?;
    server.serve(&config.listen_addr, config.listen_port)
}
