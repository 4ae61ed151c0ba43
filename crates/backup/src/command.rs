use std::process::{ExitStatus, Stdio};

use dbsentinel_core::ConnectionParams;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// An external program invocation: argument list plus the exit codes that
/// count as success. Connection parameters are passed through the libpq
/// environment, never on the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            success_codes: default_success_codes(),
        }
    }

    /// Plain-format dump written to stdout.
    pub fn pg_dump() -> Self {
        Self::new("pg_dump", ["--no-owner", "--no-privileges"])
    }

    /// Replays a plain-format dump read from stdin, stopping on the first error.
    pub fn psql() -> Self {
        Self::new("psql", ["--quiet", "--no-psqlrc", "--set", "ON_ERROR_STOP=1"])
    }

    pub fn is_success(&self, status: &ExitStatus) -> bool {
        status
            .code()
            .is_some_and(|code| self.success_codes.contains(&code))
    }

    pub(crate) fn build(&self, connection: &ConnectionParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(connection.libpq_env())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
