//! Container domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use tr_protocol::{ContainerRecord, Settings};

use crate::config::AGENT_IMAGE;

/// A container observed by the capture agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub ip: String,
}

impl Container {
    /// Whether this container is the capture agent itself
    pub fn is_agent(&self) -> bool {
        self.image.contains(AGENT_IMAGE)
    }
}

impl From<ContainerRecord> for Container {
    fn from(record: ContainerRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            image: record.image,
            ip: record.ip,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.id, self.image)
    }
}

/// Snapshot of the containers currently running on the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainersState {
    pub containers: Vec<Container>,
}

impl ContainersState {
    pub fn new(containers: Vec<Container>) -> Self {
        Self { containers }
    }

    /// Whether any observed container is the capture agent
    pub fn is_agent_running(&self) -> bool {
        self.containers.iter().any(Container::is_agent)
    }

    /// Containers on the current intercept allow-list
    pub fn intercepted<'a>(&'a self, settings: &'a Settings) -> impl Iterator<Item = &'a Container> {
        self.containers
            .iter()
            .filter(move |c| settings.intercepts(&c.id))
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl From<Vec<ContainerRecord>> for ContainersState {
    fn from(records: Vec<ContainerRecord>) -> Self {
        Self::new(records.into_iter().map(Container::from).collect())
    }
}
