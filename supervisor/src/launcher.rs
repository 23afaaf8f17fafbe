//! Builds the [`std::process::Command`] each supervised host process is
//! spawned from.
//!
//! Host processes are real OS processes, spawned by re-executing the current
//! binary with an internal "run as host" entry point and configuration
//! serialized across the process boundary, rather than anything resembling
//! a fork of live, in-memory objects.

use std::path::PathBuf;
use std::process::Command;

/// Produces the command for host process number `index` (0-based). Kept
/// as a trait, not a closure, so callers that need per-index environment
/// (a distinct log file, a distinct SQLite path) can hold state instead of
/// capturing it awkwardly.
pub trait HostLauncher: Send + Sync {
    fn build_command(&self, index: usize) -> Command;
}

/// Re-execs the current binary with a fixed argument list plus one
/// environment variable carrying the host's serialized configuration, and
/// a second carrying its index. This is the default launcher the demo
/// binary wires up; anything that wants to launch hosts a different way
/// (a distinct binary per host, a container entry point) implements
/// [`HostLauncher`] directly instead.
pub struct ReExecLauncher {
    program: PathBuf,
    host_args: Vec<String>,
    config_env_var: String,
    config_payload: String,
}

impl ReExecLauncher {
    /// `host_args` are the argv this process should be re-invoked with
    /// (e.g. `["run-host"]`); `config_payload` is the serialized host
    /// configuration, handed to the child via `config_env_var`.
    pub fn new(
        host_args: Vec<String>,
        config_env_var: impl Into<String>,
        config_payload: impl Into<String>,
    ) -> std::io::Result<Self> {
        Ok(ReExecLauncher {
            program: std::env::current_exe()?,
            host_args,
            config_env_var: config_env_var.into(),
            config_payload: config_payload.into(),
        })
    }
}

impl HostLauncher for ReExecLauncher {
    fn build_command(&self, index: usize) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.host_args);
        command.env(&self.config_env_var, &self.config_payload);
        command.env("TASKKIT_HOST_INDEX", index.to_string());
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoLauncher;

    impl HostLauncher for EchoLauncher {
        fn build_command(&self, index: usize) -> Command {
            let mut command = Command::new("true");
            command.env("TASKKIT_HOST_INDEX", index.to_string());
            command
        }
    }

    #[test]
    fn re_exec_launcher_carries_index_and_payload() {
        let launcher = ReExecLauncher::new(
            vec!["run-host".to_string()],
            "TASKKIT_HOST_CONFIG",
            "group = \"default\"",
        )
        .expect("current_exe should resolve under test");
        let command = launcher.build_command(3);
        assert_eq!(command.get_program(), std::env::current_exe().unwrap());
    }

    #[test]
    fn custom_launcher_is_usable_through_the_trait_object() {
        let launcher: Box<dyn HostLauncher> = Box::new(EchoLauncher);
        let mut command = launcher.build_command(0);
        let status = command.status().expect("spawning `true` should succeed");
        assert!(status.success());
    }
}
