use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;

// Option names shared between the option store and child command lines.
pub const OPT_COMMAND: &str = "command";
pub const OPT_PROCESS: &str = "process";
pub const OPT_PROCESS_MAX: &str = "process-max";
pub const OPT_HOST_ID: &str = "host-id";
pub const OPT_TYPE: &str = "type";
pub const OPT_STANZA: &str = "stanza";
pub const OPT_CONFIG: &str = "config";
pub const OPT_CONFIG_INCLUDE_PATH: &str = "config-include-path";
pub const OPT_CONFIG_PATH: &str = "config-path";
pub const OPT_REPO_HOST: &str = "repo-host";
pub const OPT_REPO_HOST_PORT: &str = "repo-host-port";
pub const OPT_REPO_HOST_USER: &str = "repo-host-user";
pub const OPT_REPO_HOST_CMD: &str = "repo-host-cmd";
pub const OPT_REPO_HOST_CONFIG: &str = "repo-host-config";
pub const OPT_REPO_HOST_CONFIG_INCLUDE_PATH: &str = "repo-host-config-include-path";
pub const OPT_REPO_HOST_CONFIG_PATH: &str = "repo-host-config-path";
pub const OPT_CMD_SSH: &str = "cmd-ssh";
pub const OPT_PROTOCOL_TIMEOUT: &str = "protocol-timeout";
pub const OPT_REPO_CIPHER_TYPE: &str = "repo-cipher-type";
pub const OPT_REPO_CIPHER_PASS: &str = "repo-cipher-pass";

/// Cipher type meaning no encryption is configured.
pub const CIPHER_TYPE_NONE: &str = "none";

/// Seconds a protocol endpoint may block before the operation is abandoned.
pub const DEFAULT_PROTOCOL_TIMEOUT: f64 = 1830.0;

/// Maximum number of indexed pg / repo configurations. Only one of each is
/// currently reachable but the protocol slot accounting depends on the totals.
pub const PG_INDEX_TOTAL: usize = 8;
pub const REPO_INDEX_TOTAL: usize = 1;

/// All options the store will accept from a configuration file.
const OPTION_LIST: &[&str] = &[
    OPT_COMMAND,
    OPT_PROCESS,
    OPT_PROCESS_MAX,
    OPT_HOST_ID,
    OPT_TYPE,
    OPT_STANZA,
    OPT_CONFIG,
    OPT_CONFIG_INCLUDE_PATH,
    OPT_CONFIG_PATH,
    OPT_REPO_HOST,
    OPT_REPO_HOST_PORT,
    OPT_REPO_HOST_USER,
    OPT_REPO_HOST_CMD,
    OPT_REPO_HOST_CONFIG,
    OPT_REPO_HOST_CONFIG_INCLUDE_PATH,
    OPT_REPO_HOST_CONFIG_PATH,
    OPT_CMD_SSH,
    OPT_PROTOCOL_TIMEOUT,
    OPT_REPO_CIPHER_TYPE,
    OPT_REPO_CIPHER_PASS,
];

/// Where an option value came from. The store is read-only during command
/// execution except for values adopted from a remote, which arrive as
/// `Source::Config`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Source {
    Default,
    Config,
    Param,
}

#[derive(Debug, Clone)]
struct OptionValue {
    value: Value,
    source: Source,
}

/// Configuration store for one command invocation. Options are kept in
/// insertion order so rebuilt command lines are deterministic.
pub struct Config {
    exe: String,
    command: String,
    options: IndexMap<&'static str, OptionValue>,
}

impl Config {
    pub fn new<E: Into<String>, C: Into<String>>(exe: E, command: C) -> Config {
        Config {
            exe: exe.into(),
            command: command.into(),
            options: IndexMap::new(),
        }
    }

    /// Load options from a TOML table into a fresh store. Unknown keys are
    /// rejected so typos do not silently become defaults.
    pub fn load<E, C, P>(exe: E, command: C, path: P) -> Result<Config, String>
    where
        E: Into<String>,
        C: Into<String>,
        P: AsRef<Path>,
    {
        let table: IndexMap<String, Value> =
            serdeconv::from_toml_file(path).map_err(|err| err.to_string())?;

        let mut config = Config::new(exe, command);

        for (name, value) in table {
            let known = OPTION_LIST
                .iter()
                .find(|&&option| option == name)
                .copied()
                .ok_or_else(|| format!("Unknown option '{}'", name))?;

            config.set(known, Source::Config, value);
        }

        Ok(config)
    }

    /// Path of the currently running executable.
    #[inline]
    pub fn exe(&self) -> &str {
        &self.exe
    }

    /// Name of the command being executed.
    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// True if the option has a value from any source.
    #[inline]
    pub fn is_set(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    #[inline]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.options.get(name).map(|option| &option.value)
    }

    #[inline]
    pub fn str_value(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(Value::as_str)
    }

    #[inline]
    pub fn int_value(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(Value::as_i64)
    }

    #[inline]
    pub fn float_value(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(Value::as_f64)
    }

    /// Protocol timeout in seconds, falling back to the default.
    #[inline]
    pub fn protocol_timeout(&self) -> f64 {
        self.float_value(OPT_PROTOCOL_TIMEOUT)
            .unwrap_or(DEFAULT_PROTOCOL_TIMEOUT)
    }

    #[inline]
    pub fn source(&self, name: &str) -> Source {
        self.options
            .get(name)
            .map_or(Source::Default, |option| option.source)
    }

    pub fn set(&mut self, name: &'static str, source: Source, value: Value) {
        self.options.insert(name, OptionValue { value, source });
    }

    /// Rebuild a command line for a child process executing `command`.
    ///
    /// Options currently set are inherited in store order unless named in
    /// `replace`; replacements are then appended in their own order, with a
    /// `None` replacement removing the option entirely. The command word
    /// goes last.
    pub fn exec_param(
        &self,
        command: &str,
        replace: &IndexMap<&'static str, Option<Value>>,
    ) -> Vec<String> {
        let mut param: Vec<String> = self
            .options
            .iter()
            .filter(|(name, _)| !replace.contains_key(*name))
            .map(|(name, option)| format_option(name, &option.value))
            .collect();

        for (name, value) in replace {
            if let Some(value) = value {
                param.push(format_option(name, value));
            }
        }

        param.push(command.to_string());
        param
    }
}

fn format_option(name: &str, value: &Value) -> String {
    match value {
        Value::String(value) => format!("--{}={}", name, value),
        Value::Bool(true) => format!("--{}", name),
        Value::Bool(false) => format!("--no-{}", name),
        value => format!("--{}={}", name, value),
    }
}
