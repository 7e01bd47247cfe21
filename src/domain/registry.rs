//! Read, lock and commit primitives over the remote state documents.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use itertools::Itertools;
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};

use super::{
    error::{GardenError, StateError, TransportError},
    model::{GardenRegistry, PortTable},
    port::{RegistryLock, RemoteTransport},
    remote::{quote, sh, RemoteLayout},
};

pub const STATE_MODE: u32 = 0o644;
pub const SECRET_MODE: u32 = 0o600;

#[derive(Default)]
struct Cache {
    garden: Option<GardenRegistry>,
    ports: Option<PortTable>,
}

/// Documents read under the lock.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub garden: GardenRegistry,
    pub ports: PortTable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Staged {
    path: String,
    contents: Vec<u8>,
    mode: u32,
}

/// Documents to replace or delete together in one [`RegistryStore::commit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    writes: Vec<Staged>,
    deletes: Vec<String>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_json<T: Serialize>(&mut self, path: &str, document: &T) -> Result<(), GardenError> {
        let mut contents =
            serde_json::to_vec_pretty(document).map_err(|e| StateError::CorruptDocument {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        contents.push(b'\n');
        self.put(path, contents, STATE_MODE);
        Ok(())
    }

    pub fn put(&mut self, path: &str, contents: impl Into<Vec<u8>>, mode: u32) {
        self.deletes.retain(|deleted| deleted != path);
        self.writes.retain(|staged| staged.path != path);
        self.writes.push(Staged {
            path: path.to_string(),
            contents: contents.into(),
            mode,
        });
    }

    pub fn delete(&mut self, path: &str) {
        self.writes.retain(|staged| staged.path != path);
        if !self.deletes.iter().any(|deleted| deleted == path) {
            self.deletes.push(path.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    /// Paths written then deleted, for plans and logs.
    pub fn describe(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|staged| format!("write {}", staged.path))
            .chain(self.deletes.iter().map(|path| format!("delete {path}")))
            .collect()
    }
}

pub struct RegistryStore {
    transport: Arc<dyn RemoteTransport>,
    layout: RemoteLayout,
    port_floor: u16,
    lock_timeout: Duration,
    cache: Mutex<Cache>,
}

impl RegistryStore {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        layout: RemoteLayout,
        port_floor: u16,
        lock_timeout: Duration,
    ) -> Self {
        RegistryStore {
            transport,
            layout,
            port_floor,
            lock_timeout,
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn transport(&self) -> &dyn RemoteTransport {
        self.transport.as_ref()
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    pub fn port_floor(&self) -> u16 {
        self.port_floor
    }

    /// App registry, read once per invocation.
    pub async fn garden(&self) -> Result<GardenRegistry, GardenError> {
        if let Some(garden) = self.cached(|cache| cache.garden.clone()) {
            return Ok(garden);
        }
        let garden: GardenRegistry = self
            .read_json(&self.layout.garden_json(), GardenRegistry::default)
            .await?;
        self.update_cache(|cache| cache.garden = Some(garden.clone()));
        Ok(garden)
    }

    /// Port table, read once per invocation.
    pub async fn ports(&self) -> Result<PortTable, GardenError> {
        if let Some(ports) = self.cached(|cache| cache.ports.clone()) {
            return Ok(ports);
        }
        let floor = self.port_floor;
        let ports: PortTable = self
            .read_json(&self.layout.ports_json(), || PortTable::new(floor))
            .await?;
        self.update_cache(|cache| cache.ports = Some(ports.clone()));
        Ok(ports)
    }

    pub async fn lock(&self) -> Result<RegistryLock, GardenError> {
        let lock = self
            .transport
            .acquire_lock(&self.layout.lock_dir(), self.lock_timeout)
            .await?;
        self.invalidate();
        Ok(lock)
    }

    /// Releases `lock`, logging a failed release instead of returning it.
    pub async fn unlock(&self, lock: RegistryLock) {
        let path = lock.path.clone();
        if let Err(e) = self.transport.release_lock(lock).await {
            warn!("Could not release registry lock {path}: {e}. Run `appgarden repair --force-unlock` if it stays held");
        }
        self.invalidate();
    }

    /// Fresh read of both documents under the lock.
    pub async fn snapshot(&self, _lock: &RegistryLock) -> Result<Snapshot, GardenError> {
        self.invalidate();
        Ok(Snapshot {
            garden: self.garden().await?,
            ports: self.ports().await?,
        })
    }

    /// Stages every write next to its target, then moves them all into place
    /// with one remote command. A staging failure removes the staged files
    /// and commits nothing.
    pub async fn commit(&self, lock: &RegistryLock, txn: Transaction) -> Result<(), GardenError> {
        if txn.is_empty() {
            return Ok(());
        }
        let suffix = format!(".tmp-{}", lock.token);
        let mut staged: Vec<(String, &str)> = Vec::with_capacity(txn.writes.len());
        for write in &txn.writes {
            let temp = format!("{}{suffix}", write.path);
            if let Err(e) = self
                .transport
                .write_file(&temp, &write.contents, write.mode)
                .await
            {
                self.discard(staged.iter().map(|(temp, _)| temp.as_str())).await;
                return Err(e.into());
            }
            staged.push((temp, write.path.as_str()));
        }

        let script = staged
            .iter()
            .map(|(temp, path)| format!("mv -f {} {}", quote(temp), quote(path)))
            .chain(
                (!txn.deletes.is_empty())
                    .then(|| format!("rm -f {}", txn.deletes.iter().map(|p| quote(p)).join(" "))),
            )
            .join(" && ");
        debug!("Committing {}", txn.describe().join(", "));
        let result = self.transport.run(&sh(script)).await;
        self.invalidate();
        if let Err(e) = result {
            self.discard(staged.iter().map(|(temp, _)| temp.as_str())).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn discard(&self, temps: impl Iterator<Item = &str>) {
        let temps = temps.map(quote).join(" ");
        if temps.is_empty() {
            return;
        }
        if let Err(e) = self.transport.run(&sh(format!("rm -f {temps}"))).await {
            warn!("Could not remove staged files: {e}");
        }
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        path: &str,
        missing: impl FnOnce() -> T,
    ) -> Result<T, GardenError> {
        match self.transport.read_file(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StateError::CorruptDocument {
                    path: path.to_string(),
                    detail: e.to_string(),
                }
                .into()
            }),
            Err(TransportError::NotFound(_)) => {
                warn!("{path} does not exist on {}, treating it as empty", self.transport.host());
                Ok(missing())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cached<T>(&self, read: impl FnOnce(&Cache) -> Option<T>) -> Option<T> {
        self.cache.lock().ok().and_then(|cache| read(&cache))
    }

    fn update_cache(&self, write: impl FnOnce(&mut Cache)) {
        if let Ok(mut cache) = self.cache.lock() {
            write(&mut cache);
        }
    }

    fn invalidate(&self) {
        self.update_cache(|cache| *cache = Cache::default());
    }
}
