//! Process configuration: defaults, config file, and command line.
//!
//! Every option lives in one key table. Values come from three places, in
//! increasing priority: built-in defaults, the config file, and `--key
//! value` command-line switches. Three keys are marked priority
//! (`config_file`, `create`, `print_create_sql`) and are applied before the
//! file is read so they can redirect or short-circuit the whole load.

use std::collections::HashMap;
use std::fmt;
use std::fs;

use clap::Arg;
use clap::ArgMatches;
use clap::Command;
use clap::crate_version;

use crate::logger::Logger;
use crate::util;

/// Where the config file lives unless `--config-file` says otherwise.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/myfs.d/myfs.conf";

/// How a key's value is applied when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setter {
    /// Plain string value.
    Text,
    /// Must parse as `true` or `false`.
    Flag,
    /// Boolean that also toggles the stderr mirror on the log sink.
    LogStdout,
    /// Boolean that also toggles the syslog mirror on the log sink.
    LogSyslog,
}

struct KeySpec {
    name: &'static str,
    long: &'static str,
    default: Option<String>,
    setter: Setter,
    help: &'static str,
    priority: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

pub struct Config {
    logger: &'static Logger,
    keys: Vec<KeySpec>,
    values: HashMap<&'static str, String>,
}

impl Config {
    /// Builds the key table with its defaults. The log sink is injected so
    /// the side-effectful log keys can toggle it as they are set.
    pub fn new(logger: &'static Logger) -> Config {
        let mut config = Config {
            logger,
            keys: Vec::new(),
            values: HashMap::new(),
        };

        config.register(KeySpec {
            name: "config_file",
            long: "config-file",
            default: Some(DEFAULT_CONFIG_FILE.to_string()),
            setter: Setter::Text,
            help: "The path to the MyFS config file.",
            priority: true,
        });
        config.register(KeySpec {
            name: "create",
            long: "create",
            default: Some("false".to_string()),
            setter: Setter::Flag,
            help: "Run the interactive installer and exit.",
            priority: true,
        });
        config.register(KeySpec {
            name: "print_create_sql",
            long: "print-create-sql",
            default: Some("false".to_string()),
            setter: Setter::Flag,
            help: "Print the schema DDL to stdout and exit.",
            priority: true,
        });
        config.register(KeySpec {
            name: "failed_query_retry_wait",
            long: "failed-query-retry-wait",
            default: Some("-1".to_string()),
            setter: Setter::Text,
            help: "Seconds between retries of a failed query (-1 disables).",
            priority: false,
        });
        config.register(KeySpec {
            name: "failed_query_retry_count",
            long: "failed-query-retry-count",
            default: Some("-1".to_string()),
            setter: Setter::Text,
            help: "Maximum attempts for a failed query (-1 retries forever).",
            priority: false,
        });
        config.register(KeySpec {
            name: "group",
            long: "group",
            default: Some(util::process_groupname()),
            setter: Setter::Text,
            help: "The default group for files when the stored group is unknown.",
            priority: false,
        });
        config.register(KeySpec {
            name: "log_stdout",
            long: "log-stdout",
            default: Some("true".to_string()),
            setter: Setter::LogStdout,
            help: "Whether or not to log to the console.",
            priority: false,
        });
        config.register(KeySpec {
            name: "log_syslog",
            long: "log-syslog",
            default: Some("false".to_string()),
            setter: Setter::LogSyslog,
            help: "Whether or not to log to syslog.",
            priority: false,
        });
        config.register(KeySpec {
            name: "mariadb_database",
            long: "mariadb-database",
            default: Some("myfs".to_string()),
            setter: Setter::Text,
            help: "The MariaDB database name.",
            priority: false,
        });
        config.register(KeySpec {
            name: "mariadb_host",
            long: "mariadb-host",
            default: Some("127.0.0.1".to_string()),
            setter: Setter::Text,
            help: "The MariaDB IP address or hostname.",
            priority: false,
        });
        config.register(KeySpec {
            name: "mariadb_password",
            long: "mariadb-password",
            default: None,
            setter: Setter::Text,
            help: "The MariaDB user's password.",
            priority: false,
        });
        config.register(KeySpec {
            name: "mariadb_port",
            long: "mariadb-port",
            default: Some("3306".to_string()),
            setter: Setter::Text,
            help: "The MariaDB port.",
            priority: false,
        });
        config.register(KeySpec {
            name: "mariadb_user",
            long: "mariadb-user",
            default: Some("myfs".to_string()),
            setter: Setter::Text,
            help: "The MariaDB user.",
            priority: false,
        });
        config.register(KeySpec {
            name: "mount",
            long: "mount",
            default: Some("/mnt/myfs".to_string()),
            setter: Setter::Text,
            help: "The mount point for the file system.",
            priority: false,
        });
        config.register(KeySpec {
            name: "reclaimer_level",
            long: "reclaimer-level",
            default: Some("optimistic".to_string()),
            setter: Setter::Text,
            help: "Space reclaimer level: off, optimistic, or aggressive.",
            priority: false,
        });
        config.register(KeySpec {
            name: "user",
            long: "user",
            default: Some(util::process_username()),
            setter: Setter::Text,
            help: "The default user for files when the stored user is unknown.",
            priority: false,
        });

        config
    }

    fn register(&mut self, key: KeySpec) {
        if let Some(default) = &key.default {
            // Defaults are stored without running side effects; the sink's
            // own defaults already match the table's.
            self.values.insert(key.name, default.clone());
        }
        self.keys.push(key);
    }

    /// Sets a key, running its setter. Unknown keys are an error.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let Some(key) = self.keys.iter().find(|key| key.name == name) else {
            return Err(ConfigError(format!("unknown key '{name}'")));
        };
        match key.setter {
            Setter::Text => {}
            Setter::Flag => {
                parse_bool(name, value)?;
            }
            Setter::LogStdout => {
                self.logger.log_to_stderr(parse_bool(name, value)?);
            }
            Setter::LogSyslog => {
                if parse_bool(name, value)? {
                    self.logger.log_to_syslog(Some("myfs"));
                } else {
                    self.logger.log_to_syslog(None);
                }
            }
        }
        self.values.insert(key.name, value.to_string());
        Ok(())
    }

    /// The value of a key, or the empty string when unset.
    pub fn get(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn get_u16(&self, name: &str) -> u16 {
        self.get(name).parse().unwrap_or(0)
    }

    pub fn get_i32(&self, name: &str) -> i32 {
        self.get(name).parse().unwrap_or(-1)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name) == "true"
    }

    /// Reads a `key = value` config file. Blank lines and `#` comments are
    /// skipped; whitespace around keys and values is trimmed. The whole
    /// file is parsed so every error is reported, then the first failure
    /// wins.
    pub fn load_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|err| ConfigError(format!("error reading '{path}': {err}")))?;

        let mut failures = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                failures.push(format!("{path}:{}: expected 'key = value'", index + 1));
                continue;
            };
            if let Err(err) = self.set(key.trim(), value.trim()) {
                failures.push(format!("{path}:{}: {err}", index + 1));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConfigError(failures.join("; ")))
        }
    }

    /// The command-line surface: one `--key value` switch per config key.
    pub fn command(&self) -> Command {
        let mut command = Command::new("myfs")
            .version(crate_version!())
            .about("Mounts a file system whose contents live in MariaDB");
        for key in &self.keys {
            let mut arg = Arg::new(key.name)
                .long(key.long)
                .value_name("VALUE")
                .num_args(1)
                .help(key.help);
            if key.name != key.long {
                // Accept the config-file spelling on the command line too.
                arg = arg.alias(key.name);
            }
            command = command.arg(arg);
        }
        command
    }

    /// Applies command-line values for either the priority keys or the
    /// rest, depending on `priority`.
    pub fn apply_cli(&mut self, matches: &ArgMatches, priority: bool) -> Result<(), ConfigError> {
        let names: Vec<&'static str> = self
            .keys
            .iter()
            .filter(|key| key.priority == priority)
            .map(|key| key.name)
            .collect();
        for name in names {
            if let Some(value) = matches.get_one::<String>(name) {
                let value = value.clone();
                self.set(name, &value)?;
            }
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError(format!(
            "key '{name}' expects 'true' or 'false', got '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::logger::Logger;

    fn test_config() -> Config {
        Config::new(Logger::init())
    }

    #[test]
    fn defaults_match_the_table() {
        let config = test_config();
        assert_eq!(config.get("mariadb_host"), "127.0.0.1");
        assert_eq!(config.get_u16("mariadb_port"), 3306);
        assert_eq!(config.get("mariadb_user"), "myfs");
        assert_eq!(config.get("mariadb_database"), "myfs");
        assert_eq!(config.get("mariadb_password"), "");
        assert_eq!(config.get("mount"), "/mnt/myfs");
        assert_eq!(config.get("config_file"), DEFAULT_CONFIG_FILE);
        assert_eq!(config.get_i32("failed_query_retry_wait"), -1);
        assert_eq!(config.get_i32("failed_query_retry_count"), -1);
        assert_eq!(config.get("reclaimer_level"), "optimistic");
        assert!(config.get_bool("log_stdout"));
        assert!(!config.get_bool("log_syslog"));
        assert!(!config.get_bool("create"));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let mut config = test_config();
        assert!(config.set("no_such_key", "1").is_err());
    }

    #[test]
    fn flags_validate_their_values() {
        let mut config = test_config();
        assert!(config.set("create", "true").is_ok());
        assert!(config.set("create", "yes").is_err());
    }

    #[test]
    fn file_parsing_trims_and_skips_comments() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# leading comment").expect("write");
        writeln!(file).expect("write");
        writeln!(file, "mariadb_host=db1.example.com").expect("write");
        writeln!(file, "mariadb_port     =      3307").expect("write");
        writeln!(file, "  mount = /srv/myfs  ").expect("write");
        writeln!(file, "mariadb_password =").expect("write");

        let mut config = test_config();
        let path = file.path().to_string_lossy().to_string();
        config.load_file(&path).expect("load");

        assert_eq!(config.get("mariadb_host"), "db1.example.com");
        assert_eq!(config.get_u16("mariadb_port"), 3307);
        assert_eq!(config.get("mount"), "/srv/myfs");
        assert_eq!(config.get("mariadb_password"), "");
    }

    #[test]
    fn file_with_unknown_key_fails_after_full_parse() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "bogus = 1").expect("write");
        writeln!(file, "mariadb_host = db2").expect("write");

        let mut config = test_config();
        let path = file.path().to_string_lossy().to_string();
        let err = config.load_file(&path).expect_err("unknown key");
        assert!(err.0.contains("bogus"));
        // The rest of the file was still applied.
        assert_eq!(config.get("mariadb_host"), "db2");
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut config = test_config();
        assert!(config.load_file("/nonexistent/myfs.conf").is_err());
    }

    #[test]
    fn cli_overrides_and_priority_split() {
        let mut config = test_config();
        let matches = config
            .command()
            .try_get_matches_from([
                "myfs",
                "--mariadb-host",
                "db3",
                "--config-file",
                "/tmp/alt.conf",
            ])
            .expect("parse");

        config.apply_cli(&matches, true).expect("priority keys");
        assert_eq!(config.get("config_file"), "/tmp/alt.conf");
        // Non-priority keys are untouched until the second pass.
        assert_eq!(config.get("mariadb_host"), "127.0.0.1");

        config.apply_cli(&matches, false).expect("remaining keys");
        assert_eq!(config.get("mariadb_host"), "db3");
    }

    #[test]
    fn cli_accepts_underscore_spelling() {
        let mut config = test_config();
        let matches = config
            .command()
            .try_get_matches_from(["myfs", "--mariadb_host", "db4"])
            .expect("parse");
        config.apply_cli(&matches, false).expect("apply");
        assert_eq!(config.get("mariadb_host"), "db4");
    }
}
