//! Host port pool shared by every app on a server.

use std::collections::BTreeSet;

use log::debug;

use super::{
    error::{GardenError, StateError},
    model::PortTable,
    port::RemoteTransport,
    remote::argv,
};

pub const DEFAULT_PORT_FLOOR: u16 = 10000;

impl PortTable {
    pub fn new(floor: u16) -> Self {
        PortTable {
            next_port: floor.into(),
            allocated: Default::default(),
        }
    }

    pub fn port_of(&self, owner: &str) -> Option<u16> {
        self.allocated
            .iter()
            .find(|(_, holder)| holder.as_str() == owner)
            .map(|(port, _)| *port)
    }

    /// The port [`PortTable::allocate`] would hand to `owner`, without
    /// touching the table.
    pub fn candidate(&self, owner: &str, floor: u16) -> Result<u16, StateError> {
        if let Some(port) = self.port_of(owner) {
            return Ok(port);
        }
        let free = |port: &u16| !self.allocated.contains_key(port);
        if let Some(port) = (floor..=u16::MAX)
            .take_while(|port| u32::from(*port) < self.next_port)
            .find(free)
        {
            return Ok(port);
        }
        let start = u16::try_from(self.next_port.max(floor.into()))
            .map_err(|_| StateError::PortPoolExhausted)?;
        (start..=u16::MAX).find(free).ok_or(StateError::PortPoolExhausted)
    }

    /// Gives `owner` the lowest free port. `listening` holds ports with a live
    /// socket on the server; landing on one of those is a conflict and leaves
    /// the table unchanged.
    pub fn allocate(
        &mut self,
        owner: &str,
        floor: u16,
        listening: &BTreeSet<u16>,
    ) -> Result<u16, StateError> {
        if let Some(port) = self.port_of(owner) {
            return Ok(port);
        }
        let port = self.candidate(owner, floor)?;
        if listening.contains(&port) {
            return Err(StateError::PortConflict(port));
        }
        self.take(port, owner);
        Ok(port)
    }

    /// Records `port` for `owner`, advancing the counter past it.
    pub fn take(&mut self, port: u16, owner: &str) {
        self.allocated.insert(port, owner.to_string());
        self.next_port = self.next_port.max(u32::from(port) + 1);
    }

    /// Removes every entry of `owner`, returning the freed ports.
    pub fn release(&mut self, owner: &str) -> Vec<u16> {
        let freed: Vec<u16> = self
            .allocated
            .iter()
            .filter(|(_, holder)| holder.as_str() == owner)
            .map(|(port, _)| *port)
            .collect();
        for port in &freed {
            self.allocated.remove(port);
        }
        freed
    }

    /// Records a user-chosen port. A port at or above the counter moves the
    /// counter past it; freed slots below stay available to [`PortTable::allocate`].
    pub fn register(&mut self, port: u16, owner: &str) -> Result<(), StateError> {
        match self.allocated.get(&port) {
            Some(holder) if holder != owner => Err(StateError::PortAlreadyOwned {
                port,
                owner: holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.take(port, owner);
                Ok(())
            }
        }
    }
}

/// Ports with a listening TCP socket on the server, from `ss -Htln`.
pub async fn listening_ports(transport: &dyn RemoteTransport) -> Result<BTreeSet<u16>, GardenError> {
    let output = transport.run(&argv(["ss", "-Htln"])).await?;
    let ports = parse_listening(&output);
    debug!("{} listening sockets on {}", ports.len(), transport.host());
    Ok(ports)
}

fn parse_listening(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect()
}
