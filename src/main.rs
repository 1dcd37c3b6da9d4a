// basaltd - cluster administration entry point.
//
// Subcommands:
//   basaltd init <datadir>     bootstrap a new cluster
//   basaltd status <datadir>   print control-file state
//
// The data directory may also come from BASALT_DATA_DIR. Fatal
// initialization failures exit nonzero; a running cluster is marked by
// the pid file (positive pid multi-user, negative standalone).

use std::path::PathBuf;
use std::process::exit;

use basaltdb::system::{remove_pid_file, write_pid_file};
use basaltdb::wal::ControlFile;
use basaltdb::{Config, SystemState};

fn usage() -> ! {
    eprintln!("usage: basaltd <init|status> [datadir]");
    exit(2);
}

fn data_dir(arg: Option<String>) -> PathBuf {
    match arg.or_else(|| std::env::var("BASALT_DATA_DIR").ok()) {
        Some(dir) => PathBuf::from(dir),
        None => {
            eprintln!("basaltd: no data directory given and BASALT_DATA_DIR unset");
            exit(2);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(command) => command,
        None => usage(),
    };
    let dir = data_dir(args.next());

    match command.as_str() {
        "init" => {
            let standalone = std::env::var("BASALT_STANDALONE").is_ok();
            let config = Config {
                data_dir: dir.clone(),
                standalone,
                ..Config::default()
            };
            let system = match SystemState::bootstrap(config) {
                Ok(system) => system,
                Err(e) => {
                    eprintln!("basaltd: bootstrap failed: {}", e);
                    exit(1);
                }
            };
            system.install_global();
            if let Err(e) = write_pid_file(&dir, standalone) {
                eprintln!("basaltd: cannot write pid file: {}", e);
                exit(1);
            }
            let result = system.shutdown();
            remove_pid_file(&dir);
            if let Err(e) = result {
                eprintln!("basaltd: shutdown failed: {}", e);
                exit(1);
            }
            println!("cluster initialized in {}", dir.display());
        }
        "status" => match ControlFile::load(&dir) {
            Ok(control) => {
                let data = control.get();
                println!("state:            {:?}", data.state);
                println!("checkpoint LSN:   {}", data.checkpoint);
                println!("end of log:       {}", data.end_of_log);
                println!("next xid:         {}", data.next_xid);
                println!("next oid:         {}", data.next_oid);
                println!("block size:       {}", data.blcksz);
                println!("segment pages:    {}", data.relseg_size);
                println!("catalog version:  {}", data.catalog_version_no);
            }
            Err(e) => {
                eprintln!("basaltd: cannot read control file: {}", e);
                exit(1);
            }
        },
        _ => usage(),
    }
}
