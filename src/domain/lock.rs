//! Advisory registry lock built on atomic `mkdir`.
//!
//! The lock is a directory holding an `owner` file whose first line is the
//! holder's token and whose second line describes the holder. Only the holder
//! of the token removes it; `repair --force-unlock` removes it unconditionally.

use std::{future::Future, time::Duration};

use log::{debug, info};
use rand::Rng;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use super::{
    error::{GardenError, StateError, TransportError},
    port::{CommandOutput, RegistryLock},
    remote::quote,
};

/// Exit code of [`create_script`] when someone else holds the lock.
pub const HELD_EXIT: i32 = 75;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Held(Option<String>),
}

/// Retries `attempt` with jittered exponential backoff until it reports
/// [`LockAttempt::Acquired`] or `timeout` has elapsed.
pub async fn acquire<F, Fut>(
    path: &str,
    timeout: Duration,
    mut attempt: F,
) -> Result<RegistryLock, GardenError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<LockAttempt, TransportError>>,
{
    let token = Uuid::new_v4().to_string();
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut announced = false;
    loop {
        let holder = match attempt(token.clone()).await? {
            LockAttempt::Acquired => {
                debug!("Acquired registry lock {path}");
                return Ok(RegistryLock {
                    path: path.to_string(),
                    token,
                });
            }
            LockAttempt::Held(holder) => holder,
        };
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(StateError::LockTimeout {
                path: path.to_string(),
                waited,
                holder,
            }
            .into());
        }
        if !announced {
            info!(
                "Registry lock {path} is held by {}, waiting up to {}s",
                holder.as_deref().unwrap_or("another invocation"),
                timeout.as_secs()
            );
            announced = true;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
        let pause = (backoff + Duration::from_millis(jitter_ms)).min(timeout - waited);
        sleep(pause).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Describes this invocation inside the owner file.
pub fn holder_label() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "{user} pid {} since {}",
        std::process::id(),
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    )
}

/// Shell script creating the lock. Exits with [`HELD_EXIT`] and prints the
/// current holder when the lock already exists.
pub fn create_script(path: &str, token: &str, holder: &str) -> String {
    let dir = quote(path);
    let owner = quote(&format!("{path}/owner"));
    format!(
        "if mkdir {dir} 2>/dev/null; then printf '%s\\n%s\\n' {} {} > {owner}; \
         elif [ -d {dir} ]; then sed -n 2p {owner} 2>/dev/null; exit {HELD_EXIT}; \
         else mkdir {dir}; fi",
        quote(token),
        quote(holder),
    )
}

pub fn release_script(lock: &RegistryLock) -> String {
    let dir = quote(&lock.path);
    let owner = quote(&format!("{}/owner", lock.path));
    format!(
        "if [ \"$(head -n 1 {owner} 2>/dev/null)\" = {} ]; then rm -rf {dir}; \
         else echo 'registry lock is no longer held by this invocation' >&2; exit 1; fi",
        quote(&lock.token)
    )
}

pub fn force_release_script(path: &str) -> String {
    format!("rm -rf {}", quote(path))
}

/// Maps the outcome of [`create_script`].
pub fn interpret(output: CommandOutput, command: &str) -> Result<LockAttempt, TransportError> {
    match output.code {
        0 => Ok(LockAttempt::Acquired),
        HELD_EXIT => Ok(LockAttempt::Held(
            Some(output.stdout.trim().to_string()).filter(|holder| !holder.is_empty()),
        )),
        code => Err(TransportError::CommandFailed {
            command: command.to_string(),
            code,
            stderr: output.stderr,
        }),
    }
}
