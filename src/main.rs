use std::process;

use fuser::MountOption;
use log::error;
use log::info;

use myfs::MyFs;
use myfs::Store;
use myfs::config::Config;
use myfs::db::DbClient;
use myfs::db::DbParams;
use myfs::db::RetryPolicy;
use myfs::install;
use myfs::logger::Logger;
use myfs::reclaimer::Reclaimer;
use myfs::reclaimer::ReclaimerLevel;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let logger = Logger::init();
    let mut config = Config::new(logger);

    let matches = match config.command().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            // --help and --version exit cleanly; anything else is a
            // configuration error.
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return code;
        }
    };

    // The priority keys come first so they can redirect the config file or
    // short-circuit into the installer before the file is required.
    if let Err(err) = config.apply_cli(&matches, true) {
        error!("{err}");
        return 1;
    }

    if config.get_bool("print_create_sql") {
        if let Err(err) = config.apply_cli(&matches, false) {
            error!("{err}");
            return 1;
        }
        install::print_create_sql(&config);
        return 0;
    }

    if config.get_bool("create") {
        if let Err(err) = config.apply_cli(&matches, false) {
            error!("{err}");
            return 1;
        }
        return install::run(&config);
    }

    let config_file = config.get("config_file").to_string();
    if let Err(err) = config.load_file(&config_file) {
        error!("{err}");
        return 1;
    }
    if let Err(err) = config.apply_cli(&matches, false) {
        error!("{err}");
        return 1;
    }

    info!("starting myfs v{}", env!("CARGO_PKG_VERSION"));

    let Some(level) = ReclaimerLevel::parse(config.get("reclaimer_level")) else {
        error!("invalid reclaimer_level '{}'", config.get("reclaimer_level"));
        return 1;
    };

    let params = DbParams {
        host: config.get("mariadb_host").to_string(),
        port: config.get_u16("mariadb_port"),
        user: config.get("mariadb_user").to_string(),
        password: config.get("mariadb_password").to_string(),
        database: Some(config.get("mariadb_database").to_string()),
    };

    let mut db = match DbClient::connect(&params) {
        Ok(db) => db,
        Err(err) => {
            error!("error connecting to MariaDB: {err}");
            return 2;
        }
    };
    db.set_retry_policy(RetryPolicy {
        wait: config.get_i32("failed_query_retry_wait"),
        count: config.get_i32("failed_query_retry_count"),
    });

    let store = Store::new(
        db,
        config.get("mariadb_database"),
        config.get("user"),
        config.get("group"),
    );

    let mut reclaimer = match Reclaimer::start(level, &params) {
        Ok(reclaimer) => reclaimer,
        Err(err) => {
            error!("error connecting the reclaimer to MariaDB: {err}");
            return 2;
        }
    };

    let fs = MyFs::new(store, reclaimer.notifier());
    let mount = config.get("mount").to_string();
    let options = [
        MountOption::FSName("myfs".to_string()),
        MountOption::DefaultPermissions,
    ];

    let code = match fuser::mount2(fs, &mount, &options) {
        Ok(()) => 0,
        Err(err) => {
            error!("error mounting on '{mount}': {err}");
            err.raw_os_error().unwrap_or(1)
        }
    };

    reclaimer.stop();
    info!("goodbye");
    logger.shutdown();
    code
}
