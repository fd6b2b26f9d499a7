//! In-process MRC store with optimistic concurrency and change notifications.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, instrument};

use super::{IssuerFactory, IssuerWithCa, MrcClient};
use crate::errors::{Error, Result};
use crate::messaging::{MessageBus, MrcEvent, MrcEventKind, Subscription};
use crate::mrc::MeshRootCertificate;

const MRC_EVENTS_TOPIC: &str = "mesh_root_certificates";
const RESOURCE_TYPE: &str = "MeshRootCertificate";

#[derive(Debug)]
pub struct MemoryMrcClient {
    resources: DashMap<String, MeshRootCertificate>,
    events: MessageBus<MrcEvent>,
    issuers: Arc<dyn IssuerFactory>,
}

impl MemoryMrcClient {
    pub fn new(issuers: Arc<dyn IssuerFactory>) -> Self {
        Self { resources: DashMap::new(), events: MessageBus::new(MRC_EVENTS_TOPIC), issuers }
    }

    /// Store a new MRC at version 1. Fails with a conflict if the name is taken.
    pub fn create(&self, mut mrc: MeshRootCertificate) -> Result<MeshRootCertificate> {
        let name = mrc.name().to_string();
        match self.resources.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::conflict(RESOURCE_TYPE, name)),
            Entry::Vacant(vacant) => {
                mrc.metadata.resource_version = 1;
                vacant.insert(mrc.clone());
                info!(mrc = %mrc.namespaced_name(), intent = ?mrc.spec.intent, state = %mrc.status.state, "Created MeshRootCertificate");
                self.events.publish(MrcEvent { mrc_name: name, kind: MrcEventKind::Added });
                Ok(mrc)
            }
        }
    }

    /// Create every MRC listed in a YAML file.
    pub fn load_seed_file(&self, path: &Path) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let resources: Vec<MeshRootCertificate> = serde_yaml::from_str(&contents)?;
        let count = resources.len();
        for mrc in resources {
            self.create(mrc)?;
        }
        info!(path = %path.display(), count = count, "Loaded MeshRootCertificates from seed file");
        Ok(count)
    }

    fn replace<F>(&self, incoming: MeshRootCertificate, merge: F) -> Result<MeshRootCertificate>
    where
        F: FnOnce(&mut MeshRootCertificate, MeshRootCertificate),
    {
        let name = incoming.name().to_string();
        let updated = match self.resources.entry(name.clone()) {
            Entry::Vacant(_) => return Err(Error::not_found(RESOURCE_TYPE, name)),
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                if stored.metadata.resource_version != incoming.metadata.resource_version {
                    debug!(
                        mrc = %name,
                        stored_version = stored.metadata.resource_version,
                        incoming_version = incoming.metadata.resource_version,
                        "Rejecting write against an outdated MeshRootCertificate"
                    );
                    return Err(Error::conflict(RESOURCE_TYPE, name));
                }
                merge(stored, incoming);
                stored.metadata.resource_version += 1;
                stored.clone()
            }
        };

        self.events.publish(MrcEvent { mrc_name: name, kind: MrcEventKind::Updated });
        Ok(updated)
    }
}

#[async_trait]
impl MrcClient for MemoryMrcClient {
    async fn get_mesh_root_certificate(&self, name: &str) -> Result<MeshRootCertificate> {
        self.resources
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(RESOURCE_TYPE, name))
    }

    async fn list_mesh_root_certificates(&self) -> Result<Vec<MeshRootCertificate>> {
        let mut resources: Vec<_> = self.resources.iter().map(|entry| entry.value().clone()).collect();
        resources.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(resources)
    }

    #[instrument(skip(self, mrc), fields(mrc = %mrc.name()), name = "store_update_mrc")]
    async fn update_mesh_root_certificate(&self, mrc: MeshRootCertificate) -> Result<MeshRootCertificate> {
        self.replace(mrc, |stored, incoming| {
            stored.spec = incoming.spec;
            stored.status = incoming.status;
        })
    }

    #[instrument(skip(self, mrc), fields(mrc = %mrc.name()), name = "store_update_mrc_status")]
    async fn update_mesh_root_certificate_status(&self, mrc: MeshRootCertificate) -> Result<MeshRootCertificate> {
        self.replace(mrc, |stored, incoming| stored.status = incoming.status)
    }

    async fn get_cert_issuer_for_mrc(&self, mrc: &MeshRootCertificate) -> Result<IssuerWithCa> {
        self.issuers.issuer_for(mrc).await
    }

    fn watch(&self) -> Subscription<MrcEvent> {
        self.events.subscribe()
    }
}
