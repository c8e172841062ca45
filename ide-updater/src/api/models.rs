use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibleUpdatesRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(rename = "pluginXMLIds")]
    pub plugin_xml_ids: Vec<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoCompatibleUpdate {
    /// Update id.
    pub id: u64,
    /// Marketplace plugin id.
    pub plugin_id: u64,
    pub plugin_xml_id: String,
    pub version: String,
}

/// `meta.json` of one plugin update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoUpdateMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoBrokenPlugin {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoDownloadHash {
    pub algorithm: String,
    /// Base64 encoded digest.
    pub hash: String,
}
