use crate::types::ServiceType;

/// Folder label used for services listed at the catalog root.
pub const ROOT_FOLDER: &str = "Root";

/// Builds the stable identifier of a service.
///
/// `folder` (or `Root` when empty), `service_name` and `service_type` are joined
/// with underscores and every character outside `[A-Za-z0-9_]` is replaced by an
/// underscore. Case is preserved. Upserts are keyed on this value, so the output
/// for a given triple must never change.
///
/// Distinct triples can normalise to the same key (`a-b` and `a_b`); callers
/// that care detect this by comparing urls.
pub fn derive_key(folder: &str, service_name: &str, service_type: ServiceType) -> String {
    let folder = if folder.is_empty() { ROOT_FOLDER } else { folder };

    format!("{}_{}_{}", folder, service_name, service_type)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_folder_key() {
        assert_eq!(
            derive_key("Authoritative/AQ", "Ozone", ServiceType::MapServer),
            "Authoritative_AQ_Ozone_MapServer"
        );
    }

    #[test]
    fn test_key_is_stable() {
        let first = derive_key("Authoritative/AQ", "Ozone", ServiceType::MapServer);
        for _ in 0..10 {
            assert_eq!(derive_key("Authoritative/AQ", "Ozone", ServiceType::MapServer), first);
        }
    }

    #[test]
    fn test_empty_folder_is_root() {
        assert_eq!(derive_key("", "Foo", ServiceType::FeatureServer), "Root_Foo_FeatureServer");
        assert_eq!(derive_key("Root", "Foo", ServiceType::FeatureServer), "Root_Foo_FeatureServer");
    }

    #[test]
    fn test_non_word_characters_replaced() {
        assert_eq!(
            derive_key("Water Rights", "Wells-2024 (v2)", ServiceType::GPServer),
            "Water_Rights_Wells_2024__v2__GPServer"
        );
        assert_eq!(derive_key("Eaux", "Qualité", ServiceType::MapServer), "Eaux_Qualit__MapServer");
    }

    #[test]
    fn test_case_preserved() {
        assert_ne!(
            derive_key("aq", "ozone", ServiceType::MapServer),
            derive_key("AQ", "Ozone", ServiceType::MapServer)
        );
    }

    #[test]
    fn test_known_collision() {
        assert_eq!(
            derive_key("A", "b-c", ServiceType::MapServer),
            derive_key("A", "b_c", ServiceType::MapServer)
        );
    }
}
