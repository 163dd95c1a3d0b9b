use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// ArcGIS service kinds the catalog tracks. Anything else listed by an
/// upstream server is ignored during a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceType {
    MapServer,
    FeatureServer,
    GeometryServer,
    GPServer,
    GeocodeServer,
}

impl ServiceType {
    pub const ALL: [ServiceType; 5] = [
        ServiceType::MapServer,
        ServiceType::FeatureServer,
        ServiceType::GeometryServer,
        ServiceType::GPServer,
        ServiceType::GeocodeServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::MapServer => "MapServer",
            ServiceType::FeatureServer => "FeatureServer",
            ServiceType::GeometryServer => "GeometryServer",
            ServiceType::GPServer => "GPServer",
            ServiceType::GeocodeServer => "GeocodeServer",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownServiceType(pub String);

impl fmt::Display for UnknownServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported service type: {}", self.0)
    }
}

impl std::error::Error for UnknownServiceType {}

impl FromStr for ServiceType {
    type Err = UnknownServiceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownServiceType(s.to_string()))
    }
}

/// Type restriction applied when listing a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter {
    All,
    Only(ServiceType),
}

impl TypeFilter {
    pub fn matches(&self, service_type: ServiceType) -> bool {
        match self {
            TypeFilter::All => true,
            TypeFilter::Only(t) => *t == service_type,
        }
    }

    /// Parse the `type` query parameter. A missing value means `MapServer`,
    /// `all` (any case) disables filtering.
    pub fn from_query(value: Option<&str>) -> Result<Self, UnknownServiceType> {
        match value.map(str::trim) {
            None | Some("") => Ok(TypeFilter::Only(ServiceType::MapServer)),
            Some(v) if v.eq_ignore_ascii_case("all") => Ok(TypeFilter::All),
            Some(v) => v.parse().map(TypeFilter::Only),
        }
    }
}

/// A single upstream ArcGIS service as known to the catalog.
/// This is the canonical data model used by the sync daemon, the API, and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Derived identifier, see [`crate::key::derive_key`]
    #[serde(rename = "service_key", alias = "key")]
    pub key: String,

    /// Display name, e.g. "Ozone (MapServer)"
    pub label: String,

    /// Absolute service endpoint
    pub url: String,

    /// Slash-delimited folder path, "Root" for top-level services
    pub folder: String,

    #[serde(rename = "type")]
    pub service_type: ServiceType,

    /// Source catalog the service was discovered in, e.g. "washington"
    #[serde(rename = "state")]
    pub region: String,
}

/// One layer dropped from a service when it was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerRemoval {
    pub name: String,
    pub sublayers: Vec<String>,
}

impl<'de> Deserialize<'de> for LayerRemoval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Older clients send bare layer names.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Full {
                name: String,
                #[serde(default)]
                sublayers: Vec<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Name(name) => LayerRemoval { name, sublayers: Vec::new() },
            Repr::Full { name, sublayers } => LayerRemoval { name, sublayers },
        })
    }
}

/// A service moved out of the live catalog, kept so it can be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedServiceRecord {
    #[serde(flatten)]
    pub service: ServiceDescriptor,

    pub removed_at: DateTime<Utc>,

    pub removed_by: Option<String>,

    #[serde(default)]
    pub layers_removed: Vec<LayerRemoval>,
}

impl RemovedServiceRecord {
    pub fn into_descriptor(self) -> ServiceDescriptor {
        self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_wire_names() {
        let descriptor = ServiceDescriptor {
            key: "A_Foo_MapServer".to_string(),
            label: "Foo (MapServer)".to_string(),
            url: "https://example.org/rest/services/A/Foo/MapServer".to_string(),
            folder: "A".to_string(),
            service_type: ServiceType::MapServer,
            region: "washington".to_string(),
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["service_key"], "A_Foo_MapServer");
        assert_eq!(json["type"], "MapServer");
        assert_eq!(json["state"], "washington");
    }

    #[test]
    fn test_descriptor_accepts_key_alias() {
        let json = r#"{"key":"Root_X_GPServer","label":"X (GPServer)","url":"u","folder":"Root","type":"GPServer","state":"idaho"}"#;
        let descriptor: ServiceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.key, "Root_X_GPServer");
        assert_eq!(descriptor.service_type, ServiceType::GPServer);
    }

    #[test]
    fn test_layer_removal_accepts_bare_names() {
        let layers: Vec<LayerRemoval> =
            serde_json::from_str(r#"["Sites", {"name": "Zones", "sublayers": ["North"]}]"#).unwrap();
        assert_eq!(layers[0], LayerRemoval { name: "Sites".to_string(), sublayers: vec![] });
        assert_eq!(layers[1].sublayers, vec!["North".to_string()]);
    }

    #[test]
    fn test_type_filter_from_query() {
        assert_eq!(TypeFilter::from_query(None).unwrap(), TypeFilter::Only(ServiceType::MapServer));
        assert_eq!(TypeFilter::from_query(Some("ALL")).unwrap(), TypeFilter::All);
        assert_eq!(
            TypeFilter::from_query(Some("FeatureServer")).unwrap(),
            TypeFilter::Only(ServiceType::FeatureServer)
        );
        assert!(TypeFilter::from_query(Some("ImageServer")).is_err());
    }
}
