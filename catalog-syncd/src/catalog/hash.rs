use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::{ServiceDescriptor, ServiceType};

/// Fields that identify what a client would render. Row timestamps are left out.
#[derive(Serialize)]
struct HashView<'a> {
    key: &'a str,
    region: &'a str,
    service_type: ServiceType,
    label: &'a str,
    url: &'a str,
    folder: &'a str,
}

/// SHA-256 over the live catalog, independent of input order.
/// Clients compare it to decide whether their cached copy is stale.
pub fn compute_hash(services: &[ServiceDescriptor]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| {
        let (a, b) = (&services[a], &services[b]);
        (&a.key, &a.region, a.service_type).cmp(&(&b.key, &b.region, b.service_type))
    });

    let mut hasher = Sha256::new();
    for &i in &indices {
        let s = &services[i];
        let view = HashView {
            key: &s.key,
            region: &s.region,
            service_type: s.service_type,
            label: &s.label,
            url: &s.url,
            folder: &s.folder,
        };
        // Serializing borrowed strs and a unit enum cannot fail
        if let Ok(line) = serde_json::to_vec(&view) {
            hasher.update(&line);
            hasher.update(b"\n");
        }
    }

    hex::encode(hasher.finalize())
}
