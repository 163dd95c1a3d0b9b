use serde::Deserialize;
use shared::types::RemovedServiceRecord;

/// Which fields of a removed record a keyword is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Any,
    Folder,
    Service,
    Layer,
}

/// Case-insensitive substring search over removed services.
///
/// A `layer` search also narrows each hit's `layers_removed` to the matching
/// layers. An empty keyword returns everything.
pub fn filter_removed(
    records: Vec<RemovedServiceRecord>,
    search_type: SearchType,
    keyword: &str,
) -> Vec<RemovedServiceRecord> {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return records;
    }
    let matches = |value: &str| value.to_lowercase().contains(&keyword);

    records
        .into_iter()
        .filter_map(|mut record| {
            let s = &record.service;
            let layer_hit = record.layers_removed.iter().any(|l| matches(&l.name));

            let hit = match search_type {
                SearchType::Folder => matches(&s.folder),
                SearchType::Service => matches(&s.label),
                SearchType::Layer => layer_hit,
                SearchType::Any => {
                    matches(&s.folder)
                        || matches(&s.label)
                        || layer_hit
                        || matches(&s.region)
                        || matches(&s.url)
                        || record.removed_by.as_deref().is_some_and(matches)
                }
            };
            if !hit {
                return None;
            }

            if search_type == SearchType::Layer {
                record.layers_removed.retain(|l| matches(&l.name));
            }
            Some(record)
        })
        .collect()
}
