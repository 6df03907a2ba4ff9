use crate::error::{CoreError, CoreResult};
use crate::exec::{ExecChild, ExecRead, ExecWrite};
use crate::protocol::client::ProtocolClient;
use bedrock::config::{self, Config, Source};
use bedrock::logging;
use indexmap::IndexMap;
use serde_json::Value;
use std::time::Duration;

pub const PROTOCOL_SERVICE_LOCAL: &str = "local";
pub const PROTOCOL_SERVICE_REMOTE: &str = "remote";

/// Which storage a worker operates against. Only repository storage is
/// currently reachable; the enum stays in the contract so database remotes
/// can be added without changing callers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StorageType {
    Repo,
    Pg,
}

pub type WorkerClient = ProtocolClient<ExecRead, ExecWrite>;

struct HelperSlot {
    exec: ExecChild,
    client: WorkerClient,
}

/// Cache and lifecycle manager for worker processes. One helper exists per
/// command execution; it owns every spawned worker and its protocol client,
/// handing out borrowed clients on demand. Slots are created lazily on
/// first access and torn down by `free`.
pub struct ProtocolHelper {
    local: Vec<Option<HelperSlot>>,
    remote: Vec<Option<HelperSlot>>,
    log: logging::Logger,
}

impl ProtocolHelper {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> ProtocolHelper {
        ProtocolHelper {
            local: Vec::new(),
            remote: Vec::new(),
            log: logging::child(log),
        }
    }

    /// True iff no repository host is configured.
    #[inline]
    pub fn repo_is_local(config: &Config) -> bool {
        !config.is_set(config::OPT_REPO_HOST)
    }

    /// Returns the client for local worker `protocol_id`, spawning it on
    /// first use. Ids are 1-based and bounded by `process-max`.
    pub fn local_get(
        &mut self,
        config: &Config,
        storage_type: StorageType,
        protocol_id: u32,
    ) -> CoreResult<&mut WorkerClient> {
        assert_eq!(
            storage_type,
            StorageType::Repo,
            "Only repository storage is supported until database remotes are implemented"
        );

        if self.local.is_empty() {
            let process_max = config
                .int_value(config::OPT_PROCESS_MAX)
                .expect("process-max must be configured") as usize;

            self.local.resize_with(process_max, || None);
        }

        assert!(
            protocol_id >= 1 && protocol_id as usize <= self.local.len(),
            "Local protocol id out of range"
        );

        let index = (protocol_id - 1) as usize;

        if self.local[index].is_none() {
            let timeout = Duration::from_secs_f64(config.protocol_timeout());

            let mut exec = ExecChild::new(
                config.exe(),
                Self::local_param(config, protocol_id),
                format!("{}-{} process", PROTOCOL_SERVICE_LOCAL, protocol_id),
                timeout,
                &self.log,
            );
            exec.open()?;

            let (read, write) = exec.take_io();

            let client = match ProtocolClient::new(
                format!("{}-{} protocol", PROTOCOL_SERVICE_LOCAL, protocol_id),
                PROTOCOL_SERVICE_LOCAL,
                read,
                write,
                &self.log,
            ) {
                Ok(client) => client,
                Err(err) => {
                    // The slot stays empty so a retry will re-spawn.
                    drop(exec.free());
                    return Err(err);
                }
            };

            logging::info!(self.log, "local worker ready";
                           "protocol_id" => protocol_id);

            self.local[index] = Some(HelperSlot { exec, client });
        }

        Ok(&mut self.local[index].as_mut().expect("Slot just checked").client)
    }

    /// Returns the client for the remote worker reached over a secure
    /// shell, spawning it on first use. The slot id follows the `process`
    /// option so remote and local protocol ids line up; slot 0 is reserved
    /// for the main process.
    pub fn remote_get(
        &mut self,
        config: &mut Config,
        storage_type: StorageType,
    ) -> CoreResult<&mut WorkerClient> {
        assert_eq!(
            storage_type,
            StorageType::Repo,
            "Only repository storage is supported until database remotes are implemented"
        );

        if self.remote.is_empty() {
            assert!(
                config::PG_INDEX_TOTAL >= config::REPO_INDEX_TOTAL,
                "Database index total must cover repository index total"
            );

            self.remote.resize_with(
                config::PG_INDEX_TOTAL.max(config::REPO_INDEX_TOTAL) + 1,
                || None,
            );
        }

        let protocol_id = config.int_value(config::OPT_PROCESS).unwrap_or(0) as u32;
        let index = protocol_id as usize;

        assert!(index < self.remote.len(), "Remote protocol id out of range");

        if self.remote[index].is_none() {
            let host = config
                .str_value(config::OPT_REPO_HOST)
                .expect("repo-host must be set for a remote worker")
                .to_string();
            let ssh = config
                .str_value(config::OPT_CMD_SSH)
                .unwrap_or("ssh")
                .to_string();
            let timeout = Duration::from_secs_f64(config.protocol_timeout());

            let mut exec = ExecChild::new(
                ssh,
                Self::remote_param(config, protocol_id),
                format!(
                    "{}-{} process on '{}'",
                    PROTOCOL_SERVICE_REMOTE, protocol_id, host
                ),
                timeout,
                &self.log,
            );
            exec.open()?;

            let (read, write) = exec.take_io();

            let client = match ProtocolClient::new(
                format!(
                    "{}-{} protocol on '{}'",
                    PROTOCOL_SERVICE_REMOTE, protocol_id, host
                ),
                PROTOCOL_SERVICE_REMOTE,
                read,
                write,
                &self.log,
            ) {
                Ok(client) => client,
                Err(err) => {
                    drop(exec.free());
                    return Err(err);
                }
            };

            logging::info!(self.log, "remote worker ready";
                           "protocol_id" => protocol_id,
                           "host" => &host);

            self.remote[index] = Some(HelperSlot { exec, client });

            // Adopt the remote's cipher settings when none are configured
            // locally; otherwise encrypted repositories would be unreadable
            // from hosts that only carry connection settings.
            if let Err(err) = Self::inherit_cipher(config, &mut self.remote[index]) {
                drop(Self::free_slot(self.remote[index].take(), &self.log));
                return Err(err);
            }
        }

        Ok(&mut self.remote[index].as_mut().expect("Slot just checked").client)
    }

    fn inherit_cipher(config: &mut Config, slot: &mut Option<HelperSlot>) -> CoreResult<()> {
        let cipher_unset = match config.str_value(config::OPT_REPO_CIPHER_TYPE) {
            None => true,
            Some(cipher_type) => cipher_type == config::CIPHER_TYPE_NONE,
        };

        if !cipher_unset {
            return Ok(());
        }

        let client = &mut slot.as_mut().expect("Slot must be populated").client;

        let values = client.option(&[
            config::OPT_REPO_CIPHER_TYPE,
            config::OPT_REPO_CIPHER_PASS,
        ])?;

        if values.len() != 2 {
            return Err(CoreError::ProtocolFrame(
                "expected two cipher option values".to_string(),
            ));
        }

        if values[0] != Value::from(config::CIPHER_TYPE_NONE) {
            config.set(
                config::OPT_REPO_CIPHER_TYPE,
                Source::Config,
                values[0].clone(),
            );
            config.set(
                config::OPT_REPO_CIPHER_PASS,
                Source::Config,
                values[1].clone(),
            );
        }

        Ok(())
    }

    /// Command line for a local worker: the current options with command,
    /// process id, host id and type overridden.
    fn local_param(config: &Config, protocol_id: u32) -> Vec<String> {
        let mut replace: IndexMap<&'static str, Option<Value>> = IndexMap::new();

        replace.insert(config::OPT_COMMAND, Some(Value::from(config.command())));
        replace.insert(config::OPT_PROCESS, Some(Value::from(protocol_id)));
        // Hard-coded until multi-host configuration exists.
        replace.insert(config::OPT_HOST_ID, Some(Value::from(1)));
        replace.insert(config::OPT_TYPE, Some(Value::from("backup")));

        config.exec_param(PROTOCOL_SERVICE_LOCAL, &replace)
    }

    /// Command line for the secure shell running a remote worker.
    fn remote_param(config: &Config, protocol_id: u32) -> Vec<String> {
        let mut param: Vec<String> = [
            "-o",
            "LogLevel=error",
            "-o",
            "Compression=no",
            "-o",
            "PasswordAuthentication=no",
        ]
        .iter()
        .map(|&option| option.to_string())
        .collect();

        if let Some(port) = config.int_value(config::OPT_REPO_HOST_PORT) {
            param.push("-p".to_string());
            param.push(port.to_string());
        }

        let user = config
            .str_value(config::OPT_REPO_HOST_USER)
            .expect("repo-host-user must be set for a remote worker");
        let host = config
            .str_value(config::OPT_REPO_HOST)
            .expect("repo-host must be set for a remote worker");

        param.push(format!("{}@{}", user, host));

        let mut replace: IndexMap<&'static str, Option<Value>> = IndexMap::new();

        // Config locations on the remote host take over the generic ones,
        // but only when actually configured.
        if config.source(config::OPT_REPO_HOST_CONFIG) != Source::Default {
            replace.insert(
                config::OPT_CONFIG,
                config.value(config::OPT_REPO_HOST_CONFIG).cloned(),
            );
        }

        if config.source(config::OPT_REPO_HOST_CONFIG_INCLUDE_PATH) != Source::Default {
            replace.insert(
                config::OPT_CONFIG_INCLUDE_PATH,
                config
                    .value(config::OPT_REPO_HOST_CONFIG_INCLUDE_PATH)
                    .cloned(),
            );
        }

        if config.source(config::OPT_REPO_HOST_CONFIG_PATH) != Source::Default {
            replace.insert(
                config::OPT_CONFIG_PATH,
                config.value(config::OPT_REPO_HOST_CONFIG_PATH).cloned(),
            );
        }

        if !config.is_set(config::OPT_COMMAND) {
            replace.insert(config::OPT_COMMAND, Some(Value::from(config.command())));
        }

        if !config.is_set(config::OPT_PROCESS) {
            replace.insert(config::OPT_PROCESS, Some(Value::from(protocol_id)));
        }

        // Connection settings describe how to reach the remote; the remote
        // itself has no use for them.
        for &option in &[
            config::OPT_REPO_HOST,
            config::OPT_REPO_HOST_PORT,
            config::OPT_REPO_HOST_USER,
            config::OPT_REPO_HOST_CMD,
            config::OPT_REPO_HOST_CONFIG,
            config::OPT_REPO_HOST_CONFIG_INCLUDE_PATH,
            config::OPT_REPO_HOST_CONFIG_PATH,
            config::OPT_CMD_SSH,
        ] {
            replace.insert(option, None);
        }

        // The remote stays stanza-agnostic so one worker can serve multiple
        // stanzas without restarting.
        replace.insert(config::OPT_STANZA, None);
        replace.insert(config::OPT_TYPE, Some(Value::from("backup")));

        let mut command = config.exec_param(PROTOCOL_SERVICE_REMOTE, &replace);

        command.insert(
            0,
            config
                .str_value(config::OPT_REPO_HOST_CMD)
                .unwrap_or_else(|| config.exe())
                .to_string(),
        );

        // Joined by single spaces; arguments containing spaces are a known
        // limitation and are not quoted.
        param.push(command.join(" "));
        param
    }

    /// Tears down every cached worker: the client goes first so the
    /// terminate frame reaches the worker before its exit status is
    /// collected. Idempotent; safe when nothing was ever spawned. The first
    /// teardown failure is returned after all slots have been cleared.
    pub fn free(&mut self) -> CoreResult<()> {
        let mut result = Ok(());

        for slot in self.local.iter_mut().chain(self.remote.iter_mut()) {
            if let Err(err) = Self::free_slot(slot.take(), &self.log) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    fn free_slot(slot: Option<HelperSlot>, log: &logging::Logger) -> CoreResult<()> {
        let slot = match slot {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let name = slot.exec.name().to_string();

        slot.client.free()?;

        match slot.exec.free() {
            Ok(_) => Ok(()),
            Err(err) => {
                logging::warn!(log, "worker shutdown failure";
                               "name" => &name,
                               "error" => %err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{write_frame, Greeting, Response};
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_worker(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("worker.sh");
        fs::write(&path, body).unwrap();

        let mut perm = fs::metadata(&path).unwrap().permissions();
        perm.set_mode(0o755);
        fs::set_permissions(&path, perm).unwrap();

        path.to_str().unwrap().to_string()
    }

    /// A worker that plays back pre-rendered frames and swallows whatever
    /// the client sends, exiting cleanly on end of stream.
    fn canned_worker(dir: &TempDir, frames: &[u8]) -> String {
        let mut escaped = String::new();

        for &byte in frames {
            escaped.push_str(&format!("\\{:03o}", byte));
        }

        write_worker(
            dir,
            &format!("#!/bin/sh\nprintf '{}'\ncat >/dev/null\n", escaped),
        )
    }

    /// A worker that answers the greeting a local worker would send.
    fn local_worker(dir: &TempDir) -> String {
        let mut frames = Vec::new();
        write_frame(
            &mut frames,
            &Greeting {
                service: PROTOCOL_SERVICE_LOCAL.to_string(),
            },
        )
        .unwrap();

        canned_worker(dir, &frames)
    }

    fn local_config(exe: &str) -> Config {
        let mut config = Config::new(exe, "backup");
        config.set(config::OPT_STANZA, Source::Param, json!("main"));
        config.set(config::OPT_PROCESS_MAX, Source::Config, json!(4));
        config.set(config::OPT_PROTOCOL_TIMEOUT, Source::Config, json!(5.0));
        config
    }

    fn remote_config(ssh: &str) -> Config {
        let mut config = Config::new("/usr/bin/coffer", "backup");
        config.set(config::OPT_STANZA, Source::Param, json!("main"));
        config.set(config::OPT_REPO_HOST, Source::Config, json!("r1"));
        config.set(config::OPT_REPO_HOST_USER, Source::Config, json!("bob"));
        config.set(config::OPT_CMD_SSH, Source::Config, json!(ssh));
        config.set(config::OPT_PROTOCOL_TIMEOUT, Source::Config, json!(5.0));
        config
    }

    #[test]
    fn test_repo_is_local() {
        let config = local_config("/usr/bin/coffer");
        assert!(ProtocolHelper::repo_is_local(&config));

        let config = remote_config("ssh");
        assert!(!ProtocolHelper::repo_is_local(&config));
    }

    #[test]
    fn test_local_param() {
        let config = local_config("/usr/bin/coffer");

        assert_eq!(
            ProtocolHelper::local_param(&config, 3),
            vec![
                "--stanza=main".to_string(),
                "--process-max=4".to_string(),
                "--protocol-timeout=5.0".to_string(),
                "--command=backup".to_string(),
                "--process=3".to_string(),
                "--host-id=1".to_string(),
                "--type=backup".to_string(),
                "local".to_string(),
            ]
        );
    }

    #[test]
    fn test_remote_param() {
        let mut config = remote_config("ssh");
        config.set(config::OPT_REPO_HOST_PORT, Source::Config, json!(2222));

        let param = ProtocolHelper::remote_param(&config, 0);

        assert_eq!(
            &param[..9],
            &[
                "-o".to_string(),
                "LogLevel=error".to_string(),
                "-o".to_string(),
                "Compression=no".to_string(),
                "-o".to_string(),
                "PasswordAuthentication=no".to_string(),
                "-p".to_string(),
                "2222".to_string(),
                "bob@r1".to_string(),
            ]
        );

        // The embedded remote command is joined by single spaces and never
        // carries the stanza.
        let command = param.last().unwrap();

        assert!(command.starts_with("/usr/bin/coffer "));
        assert!(command.contains("--command=backup"));
        assert!(command.contains("--process=0"));
        assert!(command.contains("--type=backup"));
        assert!(command.ends_with(" remote"));
        assert!(!command.contains("stanza"));
    }

    #[test]
    fn test_remote_param_host_config() {
        let mut config = remote_config("ssh");
        config.set(
            config::OPT_REPO_HOST_CONFIG,
            Source::Config,
            json!("/etc/coffer/remote.toml"),
        );

        let param = ProtocolHelper::remote_param(&config, 0);
        let command = param.last().unwrap();

        assert!(command.contains("--config=/etc/coffer/remote.toml"));
        assert!(!command.contains("repo-host-config"));
    }

    #[test]
    fn test_local_get_spawns_once() {
        let dir = TempDir::new().unwrap();
        let config = local_config(&local_worker(&dir));

        let mut helper = ProtocolHelper::new(None);

        let first = helper.local_get(&config, StorageType::Repo, 3).unwrap() as *mut WorkerClient;
        let second = helper.local_get(&config, StorageType::Repo, 3).unwrap() as *mut WorkerClient;

        // Same cached client, no second spawn.
        assert_eq!(first, second);

        helper.free().unwrap();
    }

    #[test]
    fn test_local_get_spawn_failure_leaves_slot_empty() {
        let bad = local_config("/nonexistent/worker");

        let mut helper = ProtocolHelper::new(None);

        match helper.local_get(&bad, StorageType::Repo, 1).unwrap_err() {
            CoreError::ExecSpawn { .. } => (),
            err => panic!("Unexpected error {:?}", err),
        }

        // A retry with a working executable re-spawns into the same slot.
        let dir = TempDir::new().unwrap();
        let good = local_config(&local_worker(&dir));

        assert!(helper.local_get(&good, StorageType::Repo, 1).is_ok());

        helper.free().unwrap();
    }

    #[test]
    #[should_panic(expected = "Local protocol id out of range")]
    fn test_local_get_id_out_of_range() {
        let config = local_config("/usr/bin/coffer");
        let mut helper = ProtocolHelper::new(None);

        drop(helper.local_get(&config, StorageType::Repo, 5));
    }

    #[test]
    fn test_remote_get_inherits_cipher() {
        let mut frames = Vec::new();
        write_frame(
            &mut frames,
            &Greeting {
                service: PROTOCOL_SERVICE_REMOTE.to_string(),
            },
        )
        .unwrap();
        write_frame(&mut frames, &Response::ok(json!(["aes-256-cbc", "supersecret"]))).unwrap();

        let dir = TempDir::new().unwrap();
        let mut config = remote_config(&canned_worker(&dir, &frames));

        let mut helper = ProtocolHelper::new(None);
        helper.remote_get(&mut config, StorageType::Repo).unwrap();

        assert_eq!(config.str_value(config::OPT_REPO_CIPHER_TYPE), Some("aes-256-cbc"));
        assert_eq!(config.str_value(config::OPT_REPO_CIPHER_PASS), Some("supersecret"));
        assert_eq!(config.source(config::OPT_REPO_CIPHER_TYPE), Source::Config);
        assert_eq!(config.source(config::OPT_REPO_CIPHER_PASS), Source::Config);

        helper.free().unwrap();
    }

    #[test]
    fn test_remote_get_cipher_already_configured() {
        let mut frames = Vec::new();
        write_frame(
            &mut frames,
            &Greeting {
                service: PROTOCOL_SERVICE_REMOTE.to_string(),
            },
        )
        .unwrap();

        let dir = TempDir::new().unwrap();
        let mut config = remote_config(&canned_worker(&dir, &frames));
        config.set(config::OPT_REPO_CIPHER_TYPE, Source::Param, json!("aes-256-cbc"));
        config.set(config::OPT_REPO_CIPHER_PASS, Source::Param, json!("local-pass"));

        let mut helper = ProtocolHelper::new(None);
        // No option query happens: the canned worker has no response queued,
        // so a query would time out rather than succeed.
        helper.remote_get(&mut config, StorageType::Repo).unwrap();

        assert_eq!(config.str_value(config::OPT_REPO_CIPHER_PASS), Some("local-pass"));

        helper.free().unwrap();
    }

    #[test]
    fn test_handshake_mismatch_tears_down() {
        let mut frames = Vec::new();
        write_frame(
            &mut frames,
            &Greeting {
                service: "archive".to_string(),
            },
        )
        .unwrap();

        let dir = TempDir::new().unwrap();
        let config = local_config(&canned_worker(&dir, &frames));

        let mut helper = ProtocolHelper::new(None);

        match helper.local_get(&config, StorageType::Repo, 1).unwrap_err() {
            CoreError::ProtocolHandshake { expected, actual } => {
                assert_eq!(expected, PROTOCOL_SERVICE_LOCAL);
                assert_eq!(actual, "archive");
            }
            err => panic!("Unexpected error {:?}", err),
        }

        helper.free().unwrap();
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut helper = ProtocolHelper::new(None);

        // Never initialized: freeing is a no-op.
        helper.free().unwrap();

        let dir = TempDir::new().unwrap();
        let config = local_config(&local_worker(&dir));

        helper.local_get(&config, StorageType::Repo, 2).unwrap();

        helper.free().unwrap();
        helper.free().unwrap();
    }
}
