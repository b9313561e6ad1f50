//! The interactive installer and the schema DDL.
//!
//! `myfs --create true` prompts for credentials, validates the target,
//! writes the config file, and creates the database, tables, seed rows and
//! the MyFS database user. `myfs --print-create-sql true` just emits the
//! DDL to stdout. Failures roll back whatever the run created.

use std::fs;
use std::io;
use std::io::BufRead;
use std::io::Write;

use nix::sys::termios;
use nix::sys::termios::LocalFlags;
use nix::sys::termios::SetArg;
use nix::unistd::AccessFlags;
use nix::unistd::access;

use crate::config::Config;
use crate::db::DbClient;
use crate::db::DbParams;
use crate::db::escape;
use crate::store::blocks::BLOCK_SIZE;
use crate::util;

/// The DDL for the three MyFS tables, in creation order.
pub fn schema_sql() -> Vec<String> {
    vec![
        "CREATE TABLE `files` (\n\
             `file_id` int(10) unsigned NOT NULL AUTO_INCREMENT,\n\
             `parent_id` int(10) unsigned NOT NULL,\n\
             `name` varchar(64) NOT NULL,\n\
             `type` enum('File','Directory','Soft Link') NOT NULL,\n\
             `user` varchar(32) NOT NULL,\n\
             `group` varchar(32) NOT NULL,\n\
             `mode` smallint(5) unsigned NOT NULL,\n\
             `size` bigint(20) unsigned NOT NULL DEFAULT 0,\n\
             `created_on` bigint(20) NOT NULL,\n\
             `last_accessed_on` bigint(20) NOT NULL,\n\
             `last_modified_on` bigint(20) NOT NULL,\n\
             `last_status_changed_on` bigint(20) NOT NULL,\n\
             PRIMARY KEY (`file_id`),\n\
             UNIQUE KEY `uq_files_parentid_name` (`parent_id`,`name`),\n\
             KEY `fk_files_parentid` (`parent_id`),\n\
             CONSTRAINT `fk_files_parentid` FOREIGN KEY (`parent_id`) \
         REFERENCES `files` (`file_id`) ON DELETE CASCADE ON UPDATE CASCADE\n\
         ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
            .to_string(),
        format!(
            "CREATE TABLE `file_data` (\n\
                 `file_data_id` bigint(20) unsigned NOT NULL AUTO_INCREMENT,\n\
                 `file_id` int(10) unsigned NOT NULL,\n\
                 `index` int(10) unsigned NOT NULL,\n\
                 `data` varbinary({BLOCK_SIZE}) NOT NULL,\n\
                 PRIMARY KEY (`file_data_id`),\n\
                 UNIQUE KEY `uq_filedata_fileid_index` (`file_id`,`index`),\n\
                 KEY `fk_filedata_fileid` (`file_id`),\n\
                 CONSTRAINT `fk_filedata_fileid` FOREIGN KEY (`file_id`) \
             REFERENCES `files` (`file_id`) ON DELETE CASCADE ON UPDATE CASCADE\n\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
        ),
        "CREATE TABLE `file_protection` (\n\
             `file_id` int(10) unsigned NOT NULL,\n\
             PRIMARY KEY (`file_id`),\n\
             CONSTRAINT `fk_fileprotection_fileid` FOREIGN KEY (`file_id`) \
         REFERENCES `files` (`file_id`) ON DELETE CASCADE\n\
         ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
            .to_string(),
    ]
}

/// Statements seeding the root directory and its protection row. The root
/// must keep file_id 0, which auto-increment only allows under
/// NO_AUTO_VALUE_ON_ZERO.
pub fn seed_sql(user: &str, group: &str) -> Vec<String> {
    vec![
        "SET SESSION sql_mode=CONCAT(@@sql_mode,',NO_AUTO_VALUE_ON_ZERO')".to_string(),
        format!(
            "INSERT INTO `files` \
             (`file_id`,`parent_id`,`name`,`type`,`user`,`group`,`mode`,`size`,\
              `created_on`,`last_accessed_on`,`last_modified_on`,`last_status_changed_on`) \
             VALUES (0,0,'','Directory','{}','{}',{},0,\
              UNIX_TIMESTAMP(),UNIX_TIMESTAMP(),UNIX_TIMESTAMP(),UNIX_TIMESTAMP())",
            escape(user),
            escape(group),
            0o040775
        ),
        "INSERT INTO `file_protection` (`file_id`) VALUES (0)".to_string(),
    ]
}

/// Prints the schema and seed statements to stdout.
pub fn print_create_sql(config: &Config) {
    for statement in schema_sql() {
        println!("{statement};\n");
    }
    for statement in seed_sql(config.get("user"), config.get("group")) {
        println!("{statement};\n");
    }
}

struct InstallParams {
    config_path: String,
    host: String,
    port: String,
    root_user: String,
    root_password: String,
    user: String,
    password: String,
    database: String,
    mount: String,
}

/// Runs the interactive installer. Returns the process exit code.
pub fn run(config: &Config) -> i32 {
    let mut params = InstallParams {
        config_path: config.get("config_file").to_string(),
        host: config.get("mariadb_host").to_string(),
        port: config.get("mariadb_port").to_string(),
        root_user: "root".to_string(),
        root_password: String::new(),
        user: config.get("mariadb_user").to_string(),
        password: String::new(),
        database: config.get("mariadb_database").to_string(),
        mount: config.get("mount").to_string(),
    };

    match run_steps(config, &mut params) {
        Ok(true) => {
            println!("Config file and database installed!");
            0
        }
        Ok(false) => 1,
        Err(err) => {
            println!("  Error reading input: {err}");
            1
        }
    }
}

fn run_steps(config: &Config, params: &mut InstallParams) -> io::Result<bool> {
    if !prompt_settings(params)? {
        return Ok(false);
    }

    let mut db = match connect_super_user(params) {
        Some(db) => db,
        None => return Ok(false),
    };

    if !validate(params, &mut db)? {
        return Ok(false);
    }

    let mut config_created = false;
    let mut database_created = false;
    let success = create_config_file(params, &mut config_created)
        && create_database(config, params, &mut db, &mut database_created);

    if !success {
        cleanup(params, &mut db, config_created, database_created);
    }
    Ok(success)
}

fn prompt_settings(params: &mut InstallParams) -> io::Result<bool> {
    println!("Welcome to the MyFS utility to create and initialize a MyFS instance.");
    println!();
    println!(
        "You'll be prompted to enter a file path to put the config file, database \
         credentials for a super user that can create a database, and database credentials \
         for the MyFS database. The database host and port will be the same for both sets \
         of credentials."
    );
    println!();
    println!(
        "For each prompt, a default value is given in brackets and may be used by simply \
         pressing 'Enter'. Passwords do not have a default value. For password prompts, you \
         will not see the characters you type but the password is being captured."
    );
    println!();

    loop {
        let input = prompt(&format!("Config file [{}]", params.config_path))?;
        if !input.is_empty() {
            if !input.ends_with(".conf") {
                println!("  Config file must end with .conf");
                continue;
            }
            params.config_path = input;
            println!("  Config file path changed to {}.", params.config_path);
        }
        break;
    }

    let input = prompt(&format!("MariaDB host [{}]", params.host))?;
    if !input.is_empty() {
        params.host = input;
        println!("  MariaDB host changed to {}.", params.host);
    }

    let input = prompt(&format!("MariaDB port [{}]", params.port))?;
    if !input.is_empty() {
        params.port = input;
        println!("  MariaDB port changed to {}.", params.port);
    }

    let input = prompt(&format!("MariaDB super user [{}]", params.root_user))?;
    if !input.is_empty() {
        params.root_user = input;
        println!("  MariaDB super user changed to {}.", params.root_user);
    }

    while params.root_password.is_empty() {
        params.root_password = prompt_password("MariaDB super user password")?;
    }
    println!("  MariaDB super user password accepted.");

    let input = prompt(&format!("MariaDB MyFS user [{}]", params.user))?;
    if !input.is_empty() {
        params.user = input;
        println!("  MariaDB MyFS user changed to {}.", params.user);
    }

    loop {
        let mut first = String::new();
        while first.is_empty() {
            first = prompt_password("MariaDB MyFS user password")?;
        }
        let mut second = String::new();
        while second.is_empty() {
            second = prompt_password("Confirm MariaDB MyFS user password")?;
        }
        if first != second {
            println!("  Passwords do not match, try again.");
            continue;
        }
        params.password = first;
        break;
    }
    println!("  MariaDB user password accepted.");

    let input = prompt(&format!("MariaDB MyFS database [{}]", params.database))?;
    if !input.is_empty() {
        params.database = input;
        println!("  MariaDB MyFS database changed to {}.", params.database);
    }

    println!();
    println!("Double check the settings below:");
    println!("The config file will be created at {}.", params.config_path);
    println!(
        "The MariaDB super user used to create the database and tables is {}@{}:{}.",
        params.root_user, params.host, params.port
    );
    println!(
        "The MariaDB MyFS user and database is {}@{}:{}/{}.",
        params.user, params.host, params.port, params.database
    );
    println!();

    let mut answer = String::new();
    while answer.is_empty() {
        answer = prompt("Do you wish to continue [y/n]?")?;
    }
    Ok(answer == "y")
}

fn connect_super_user(params: &InstallParams) -> Option<DbClient> {
    println!();
    println!("Running validation checks.");
    println!(
        "Connecting to MariaDB at {}@{}:{}.",
        params.root_user, params.host, params.port
    );

    let db_params = DbParams {
        host: params.host.clone(),
        port: params.port.parse().unwrap_or(3306),
        user: params.root_user.clone(),
        password: params.root_password.clone(),
        database: None,
    };
    match DbClient::connect(&db_params) {
        Ok(db) => {
            println!("  MariaDB connection is good.");
            Some(db)
        }
        Err(err) => {
            println!("  Error connecting to MariaDB: {err}.");
            None
        }
    }
}

fn validate(params: &InstallParams, db: &mut DbClient) -> io::Result<bool> {
    println!("Checking config file {}.", params.config_path);

    let dir = util::dirname(&params.config_path);
    if access(dir, AccessFlags::W_OK).is_err() {
        println!("  {dir} is not writable.");
        return Ok(false);
    }
    if fs::metadata(&params.config_path).is_ok() {
        println!("  {} already exists.", params.config_path);
        return Ok(false);
    }
    println!("  Config file is good.");

    println!(
        "Checking to make sure database '{}' does not exist.",
        params.database
    );
    match db.query_rows(&format!("SHOW DATABASES LIKE '{}'", escape(&params.database))) {
        Ok(rows) if rows.is_empty() => {
            println!("  The database does not exist.");
            Ok(true)
        }
        Ok(_) => {
            println!("  That database already exists.");
            Ok(false)
        }
        Err(err) => {
            println!("  Error checking database: {err}");
            Ok(false)
        }
    }
}

/// The generated config file, in the parser's own `key = value` syntax.
pub fn config_file_contents(params_user: &str, database: &str, host: &str, port: &str, mount: &str) -> String {
    format!(
        "# Whether or not to log to the console.\n\
         log_stdout = true\n\
         \n\
         # Whether or not to log to syslog.\n\
         log_syslog = false\n\
         \n\
         # The MariaDB database name.\n\
         mariadb_database = {database}\n\
         \n\
         # The MariaDB IP address or hostname.\n\
         mariadb_host = {host}\n\
         \n\
         # The MariaDB user's password.\n\
         mariadb_password =\n\
         \n\
         # The MariaDB port.\n\
         mariadb_port = {port}\n\
         \n\
         # The MariaDB user.\n\
         mariadb_user = {params_user}\n\
         \n\
         # The mount point for the file system.\n\
         mount = {mount}\n\
         \n\
         # Seconds between retries of a failed query (-1 disables).\n\
         failed_query_retry_wait = -1\n\
         \n\
         # Maximum attempts for a failed query (-1 retries forever).\n\
         failed_query_retry_count = -1\n\
         \n\
         # Space reclaimer level: off, optimistic, or aggressive.\n\
         reclaimer_level = optimistic\n"
    )
}

fn create_config_file(params: &InstallParams, created: &mut bool) -> bool {
    println!("Creating {}", params.config_path);

    let contents = config_file_contents(
        &params.user,
        &params.database,
        &params.host,
        &params.port,
        &params.mount,
    );
    match fs::write(&params.config_path, contents) {
        Ok(()) => {
            *created = true;
            true
        }
        Err(err) => {
            println!("  Error writing {}: {err}", params.config_path);
            false
        }
    }
}

fn create_database(
    config: &Config,
    params: &InstallParams,
    db: &mut DbClient,
    created: &mut bool,
) -> bool {
    println!("Creating database '{}'", params.database);

    let database = ident(&params.database);
    if let Err(err) = db.query(&format!("CREATE DATABASE {database}")) {
        println!("  Error creating database '{}': {err}", params.database);
        return false;
    }
    *created = true;

    if let Err(err) = db.query(&format!("USE {database}")) {
        println!("  Error selecting database '{}': {err}", params.database);
        return false;
    }

    println!("Creating database tables");
    for statement in schema_sql() {
        if let Err(err) = db.query(&statement) {
            println!("  Error creating tables: {err}");
            return false;
        }
    }
    for statement in seed_sql(config.get("user"), config.get("group")) {
        if let Err(err) = db.query(&statement) {
            println!("  Error seeding the root directory: {err}");
            return false;
        }
    }

    println!("Creating database user '{}'", params.user);
    let grants = [
        format!(
            "CREATE USER '{}'@'{}' IDENTIFIED BY '{}'",
            escape(&params.user),
            escape(&params.host),
            escape(&params.password)
        ),
        format!(
            "GRANT USAGE ON {database}.* TO '{}'@'{}'",
            escape(&params.user),
            escape(&params.host)
        ),
        format!(
            "GRANT ALL PRIVILEGES ON {database}.* TO '{}'@'{}' WITH GRANT OPTION",
            escape(&params.user),
            escape(&params.host)
        ),
    ];
    for statement in &grants {
        if let Err(err) = db.query(statement) {
            println!("  Error creating user '{}': {err}", params.user);
            return false;
        }
    }
    if let Err(err) = db.query("FLUSH PRIVILEGES") {
        println!("  Error flushing privileges: {err}");
        println!("  You'll need to do this manually");
    }

    true
}

fn cleanup(params: &InstallParams, db: &mut DbClient, config_created: bool, database_created: bool) {
    // Never remove a config file the run did not create.
    if config_created {
        if let Err(err) = fs::remove_file(&params.config_path) {
            println!(
                "  Error deleting config file {}: {err}",
                params.config_path
            );
        }
    }
    if database_created {
        if let Err(err) = db.query(&format!("DROP DATABASE {}", ident(&params.database))) {
            println!("  Error dropping database '{}': {err}", params.database);
        }
    }
}

/// Backtick-quotes an identifier for splicing into DDL.
fn ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Like [`prompt`] but with terminal echo off, for passwords.
fn prompt_password(label: &str) -> io::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;

    let stdin = io::stdin();
    let saved = termios::tcgetattr(&stdin).ok();
    if let Some(saved) = &saved {
        let mut quiet = saved.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &quiet);
    }

    let mut line = String::new();
    let result = io::stdin().lock().read_line(&mut line);

    if let Some(saved) = &saved {
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, saved);
        println!();
    }
    result?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::config::Config;
    use crate::logger::Logger;

    #[test]
    fn schema_matches_the_block_model() {
        let ddl = schema_sql().join(";\n");
        assert!(ddl.contains("CREATE TABLE `files`"));
        assert!(ddl.contains("CREATE TABLE `file_data`"));
        assert!(ddl.contains("CREATE TABLE `file_protection`"));
        assert!(ddl.contains(&format!("varbinary({BLOCK_SIZE})")));
        assert!(ddl.contains("UNIQUE KEY `uq_files_parentid_name` (`parent_id`,`name`)"));
        assert!(ddl.contains("UNIQUE KEY `uq_filedata_fileid_index` (`file_id`,`index`)"));
        assert!(ddl.contains("ON DELETE CASCADE"));
        assert!(ddl.contains("utf8mb4_general_ci"));
    }

    #[test]
    fn seeds_protect_the_root() {
        let seeds = seed_sql("admin", "admin").join(";\n");
        assert!(seeds.contains("NO_AUTO_VALUE_ON_ZERO"));
        assert!(seeds.contains("VALUES (0,0,'','Directory','admin','admin',16893,0,"));
        assert!(seeds.contains("INSERT INTO `file_protection` (`file_id`) VALUES (0)"));
    }

    #[test]
    fn seed_values_are_escaped() {
        let seeds = seed_sql("o'brien", "staff").join(";\n");
        assert!(seeds.contains("o\\'brien"));
    }

    #[test]
    fn identifiers_are_backtick_quoted() {
        assert_eq!(ident("myfs"), "`myfs`");
        assert_eq!(ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn generated_config_round_trips_through_the_parser() {
        let contents = config_file_contents("myfs", "myfsdb", "db1", "3307", "/mnt/x");
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");

        let mut config = Config::new(Logger::init());
        let path = file.path().to_string_lossy().to_string();
        config.load_file(&path).expect("generated file must parse");
        assert_eq!(config.get("mariadb_database"), "myfsdb");
        assert_eq!(config.get("mariadb_host"), "db1");
        assert_eq!(config.get_u16("mariadb_port"), 3307);
        assert_eq!(config.get("mount"), "/mnt/x");
        assert_eq!(config.get("mariadb_password"), "");
    }
}
