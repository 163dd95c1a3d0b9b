/// Query suffix asking an ArcGIS REST endpoint for its JSON listing
pub const ARCGIS_JSON_QUERY: &str = "?f=json";

/// Catalog endpoints served by the sync daemon
pub const SERVICES_PATH: &str = "/arcgis/services";
pub const SERVICES_HASH_PATH: &str = "/arcgis/services/hash";
pub const SERVICES_STATS_PATH: &str = "/arcgis/services/stats";
pub const BULK_ADD_PATH: &str = "/arcgis/services/bulk-add";
pub const REMOVE_PATH: &str = "/arcgis/services/remove";
pub const RENAME_PATH: &str = "/arcgis/services/rename";
pub const RENAME_FOLDER_PATH: &str = "/arcgis/services/rename-folder";
pub const REMOVED_PATH: &str = "/arcgis/services/removed";
pub const RESTORE_PATH: &str = "/arcgis/services/removed/restore";
pub const SYNC_PATH: &str = "/arcgis/services/sync";
