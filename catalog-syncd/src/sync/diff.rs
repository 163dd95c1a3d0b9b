use std::collections::{HashMap, HashSet};
use shared::types::{ServiceDescriptor, ServiceType};

/// Two different upstream services that derived the same key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCollision {
    pub key: String,
    pub kept_url: String,
    pub dropped_url: String,
}

/// Collapse a crawl to one descriptor per `(key, type)`, first one wins.
///
/// Exact repeats (same url) are dropped quietly; anything else sharing a key is
/// returned as a collision.
pub fn dedupe_by_key(services: Vec<ServiceDescriptor>) -> (Vec<ServiceDescriptor>, Vec<KeyCollision>) {
    let mut seen: HashMap<(String, ServiceType), usize> = HashMap::new();
    let mut unique: Vec<ServiceDescriptor> = Vec::with_capacity(services.len());
    let mut collisions = Vec::new();

    for service in services {
        let id = (service.key.clone(), service.service_type);
        match seen.get(&id).copied() {
            Some(idx) => {
                let kept = &unique[idx];
                if kept.url != service.url {
                    collisions.push(KeyCollision {
                        key: service.key,
                        kept_url: kept.url.clone(),
                        dropped_url: service.url,
                    });
                }
            }
            None => {
                seen.insert(id, unique.len());
                unique.push(service);
            }
        }
    }

    (unique, collisions)
}

/// Descriptors from `current` whose key is not in `existing`, in input order.
///
/// Additive only: a known key is never reported, even when its label or folder
/// differs from what is stored, so administrator edits survive a sync.
pub fn diff_new(current: &[ServiceDescriptor], existing: &HashSet<String>) -> Vec<ServiceDescriptor> {
    current
        .iter()
        .filter(|service| !existing.contains(&service.key))
        .cloned()
        .collect()
}
