//! Entry point: parse options, connect the three backend namespaces, and
//! mount the filesystem via `fuser`.

use clap::Parser;
use zdbfs::backend::{Backend, RedisBackend};
use zdbfs::config::{Cli, Options};
use zdbfs::engine::Zdbfs;

fn connect_namespace(addr: &zdbfs::config::NamespaceAddr, label: &str) -> Box<dyn Backend> {
    match RedisBackend::connect(addr, &format!("{label}:nextid")) {
        Ok(backend) => Box::new(backend),
        Err(e) => {
            log::error!("failed to connect {label} namespace at {}:{}: {e}", addr.host, addr.port);
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let opts = Options::from_cli(cli);

    if let Some(path) = &opts.logfile {
        let target = Box::new(std::fs::File::create(path).unwrap_or_else(|e| {
            eprintln!("cannot open log file {path}: {e}");
            std::process::exit(1);
        }));
        env_logger::Builder::from_default_env()
            .target(env_logger::Target::Pipe(target))
            .init();
    } else {
        env_logger::init();
    }

    log::info!("connecting to backend namespaces");
    let meta = connect_namespace(&opts.meta, "meta");
    let data = connect_namespace(&opts.data, "data");
    let temp = connect_namespace(&opts.temp, "temp");

    let mountpoint = opts.mountpoint.clone();
    let fs = match Zdbfs::new(opts, meta, data, temp) {
        Ok(fs) => fs,
        Err(e) => {
            log::error!("failed to initialise filesystem: {e}");
            std::process::exit(1);
        }
    };

    let options = vec![
        fuser::MountOption::FSName("zdbfs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];

    log::info!("mounting zdbfs at {mountpoint}");
    if let Err(e) = fuser::mount2(fs, &mountpoint, &options) {
        log::error!("mount failed: {e}");
        std::process::exit(1);
    }
}
