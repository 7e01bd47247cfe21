use std::{collections::HashMap, path::Path, time::Duration};

use async_trait::async_trait;

use super::error::{GardenError, TransportError};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Proof of holding the registry lock. Not `Clone`: it is
/// handed back to [`RemoteTransport::release_lock`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistryLock {
    pub path: String,
    pub token: String,
}

/// Remote execution channel to one server.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Name used in connection errors and logs.
    fn host(&self) -> &str;

    /// Fails with [`TransportError::NotFound`] when the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Creates missing parent directories.
    async fn write_file(&self, path: &str, contents: &[u8], mode: u32)
        -> Result<(), TransportError>;

    /// Runs `argv` and reports its exit code; a non-zero exit is not an error here.
    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, TransportError>;

    /// Replaces `remote` with the contents of `local`, skipping `exclude` globs
    /// and, when `gitignore` is set, anything ignored by `.gitignore` files.
    async fn upload_directory(
        &self,
        local: &Path,
        remote: &str,
        exclude: &[String],
        gitignore: bool,
    ) -> Result<(), TransportError>;

    async fn acquire_lock(&self, path: &str, timeout: Duration)
        -> Result<RegistryLock, GardenError>;

    async fn release_lock(&self, lock: RegistryLock) -> Result<(), TransportError>;

    /// Runs `argv` and fails with [`TransportError::CommandFailed`] on a non-zero exit.
    async fn run(&self, argv: &[String]) -> Result<String, TransportError> {
        let output = self.run_command(argv).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(TransportError::CommandFailed {
                command: argv.join(" "),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// Pure text templating: the same name and variables always give the same text.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, vars: &HashMap<&str, String>) -> Result<String, GardenError>;
}
