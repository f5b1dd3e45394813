use std::{collections::BTreeMap, fmt};

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::Error as _,
    ser::SerializeMap,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const DEFAULT_FORMATTER: &str = "gdrive";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const DEFAULT_ENCRYPT_PATH: &str = "/encrypt-user-data";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_NOTIFICATION_AUTO_CLOSE_MS: u64 = 5_000;
pub const DEFAULT_NATIVE_SCHEME: &str = "stremio";
pub const DEFAULT_WEB_APP_ENTRY: &str = "https://web.stremio.com/#/addons?addon=";
pub const ALLOWED_FORMATTERS: &[&str] = &[
    "gdrive",
    "minimalistic-gdrive",
    "torrentio",
    "torbox",
    "imposter",
];

/// Characters left untouched by `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const DEFAULT_RESOLUTIONS: &[&str] = &["2160p", "1080p", "720p", "480p", "Unknown"];
const DEFAULT_QUALITIES: &[&str] = &[
    "BluRay REMUX",
    "BluRay",
    "WEB-DL",
    "WEBRip",
    "HDRip",
    "HC HD-Rip",
    "DVDRip",
    "HDTV",
    "CAM",
    "TS",
    "TC",
    "SCR",
    "Unknown",
];
const DEFAULT_VISUAL_TAGS: &[&str] = &["HDR+DV", "HDR10+", "HDR10", "HDR", "DV", "3D", "IMAX", "AI"];
const DEFAULT_AUDIO_TAGS: &[&str] = &[
    "Atmos",
    "DD+",
    "DD",
    "DTS-HD MA",
    "DTS-HD",
    "DTS",
    "TrueHD",
    "5.1",
    "7.1",
    "AC3",
    "AAC",
];
const DEFAULT_ENCODES: &[&str] = &["AV1", "HEVC", "AVC", "H-OU", "H-SBS", "Unknown"];

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid encoded segment: {0}")]
    InvalidSegment(String),
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
}

/// One `{label: enabled}` pair of an ordered preference list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceEntry {
    pub label: String,
    pub enabled: bool,
}

impl PreferenceEntry {
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        Self {
            label: label.into(),
            enabled,
        }
    }
}

impl Serialize for PreferenceEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.label, &self.enabled)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for PreferenceEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, bool>::deserialize(deserializer)?;
        let mut entries = map.into_iter();
        match (entries.next(), entries.next()) {
            (Some((label, enabled)), None) => Ok(Self { label, enabled }),
            _ => Err(D::Error::custom(
                "preference entry must have exactly one label",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// `{criterion: enabled, direction?}` as found in the `sortBy` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortCriterion {
    pub criterion: String,
    pub enabled: bool,
    pub direction: Option<SortDirection>,
}

impl SortCriterion {
    pub fn new(criterion: impl Into<String>, enabled: bool) -> Self {
        Self {
            criterion: criterion.into(),
            enabled,
            direction: None,
        }
    }

    pub fn with_direction(mut self, direction: SortDirection) -> Self {
        self.direction = Some(direction);
        self
    }
}

impl Serialize for SortCriterion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.direction.is_some() { 2 } else { 1 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(&self.criterion, &self.enabled)?;
        if let Some(direction) = &self.direction {
            map.serialize_entry("direction", direction)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SortCriterion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut map = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let direction = match map.remove("direction") {
            Some(value) => Some(SortDirection::deserialize(value).map_err(D::Error::custom)?),
            None => None,
        };
        let mut entries = map.into_iter();
        match (entries.next(), entries.next()) {
            (Some((criterion, serde_json::Value::Bool(enabled))), None) => Ok(Self {
                criterion,
                enabled,
                direction,
            }),
            (Some((criterion, other)), None) => Err(D::Error::custom(format!(
                "sort criterion {criterion} must map to a boolean, got {other}"
            ))),
            _ => Err(D::Error::custom(
                "sort criterion must have exactly one criterion key",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonEntry {
    pub id: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub id: String,
    pub enabled: bool,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

/// Proxy block. `None` allow-lists mean "no restriction"; `Some(vec![])`
/// means "proxy nothing".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub media_flow_enabled: bool,
    pub proxy_url: String,
    pub api_password: String,
    pub public_ip: String,
    pub proxied_addons: Option<Vec<String>>,
    pub proxied_services: Option<Vec<String>>,
}

/// Immutable snapshot of every preference, in the wire shape the addon
/// server expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub resolutions: Vec<PreferenceEntry>,
    pub qualities: Vec<PreferenceEntry>,
    pub visual_tags: Vec<PreferenceEntry>,
    pub audio_tags: Vec<PreferenceEntry>,
    pub encodes: Vec<PreferenceEntry>,
    pub sort_by: Vec<SortCriterion>,
    pub only_show_cached_streams: bool,
    pub prioritised_languages: Option<Vec<String>>,
    pub excluded_languages: Option<Vec<String>>,
    pub max_movie_size: Option<u64>,
    pub min_movie_size: Option<u64>,
    pub max_episode_size: Option<u64>,
    pub min_episode_size: Option<u64>,
    pub addon_name_in_description: bool,
    pub clean_results: bool,
    pub max_results_per_resolution: Option<u32>,
    pub formatter: String,
    pub media_flow_config: ProxyConfig,
    pub addons: Vec<AddonEntry>,
    pub services: Vec<ServiceEntry>,
}

/// Field values held by the form before assembly.
///
/// Every field is optional in serialized form so a partial preferences
/// file fills the rest from the shipped defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub resolutions: Vec<PreferenceEntry>,
    pub qualities: Vec<PreferenceEntry>,
    pub visual_tags: Vec<PreferenceEntry>,
    pub audio_tags: Vec<PreferenceEntry>,
    pub encodes: Vec<PreferenceEntry>,
    pub sort_by: Vec<SortCriterion>,
    pub only_show_cached_streams: bool,
    pub prioritised_languages: Option<Vec<String>>,
    pub excluded_languages: Option<Vec<String>>,
    pub max_movie_size: Option<u64>,
    pub min_movie_size: Option<u64>,
    pub max_episode_size: Option<u64>,
    pub min_episode_size: Option<u64>,
    pub addon_name_in_description: bool,
    pub clean_results: bool,
    pub max_results_per_resolution: Option<u32>,
    pub formatter: Option<String>,
    pub media_flow_config: ProxyConfig,
    pub addons: Vec<AddonEntry>,
    pub services: Vec<ServiceEntry>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            resolutions: enabled_entries(DEFAULT_RESOLUTIONS),
            qualities: enabled_entries(DEFAULT_QUALITIES),
            visual_tags: enabled_entries(DEFAULT_VISUAL_TAGS),
            audio_tags: enabled_entries(DEFAULT_AUDIO_TAGS),
            encodes: enabled_entries(DEFAULT_ENCODES),
            sort_by: default_sort_criteria(),
            only_show_cached_streams: false,
            prioritised_languages: None,
            excluded_languages: None,
            max_movie_size: None,
            min_movie_size: None,
            max_episode_size: None,
            min_episode_size: None,
            addon_name_in_description: false,
            clean_results: false,
            max_results_per_resolution: None,
            formatter: None,
            media_flow_config: ProxyConfig::default(),
            addons: Vec::new(),
            services: Vec::new(),
        }
    }
}

fn enabled_entries(labels: &[&str]) -> Vec<PreferenceEntry> {
    labels
        .iter()
        .map(|label| PreferenceEntry::new(*label, true))
        .collect()
}

fn default_sort_criteria() -> Vec<SortCriterion> {
    vec![
        SortCriterion::new("cached", true).with_direction(SortDirection::Desc),
        SortCriterion::new("resolution", true),
        SortCriterion::new("language", true),
        SortCriterion::new("size", true).with_direction(SortDirection::Desc),
        SortCriterion::new("visualTag", false),
        SortCriterion::new("service", false),
        SortCriterion::new("audioTag", false),
        SortCriterion::new("encode", false),
        SortCriterion::new("quality", false),
        SortCriterion::new("seeders", false).with_direction(SortDirection::Desc),
        SortCriterion::new("addon", false),
    ]
}

/// Holds the current form state and produces [`Configuration`] snapshots.
///
/// `revision` increases on every edit so a caller can tell whether a
/// snapshot it holds is stale.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    preferences: Preferences,
    revision: u64,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_preferences(preferences: Preferences) -> Self {
        Self {
            preferences,
            revision: 0,
        }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn edit(&mut self, apply: impl FnOnce(&mut Preferences)) {
        apply(&mut self.preferences);
        self.revision += 1;
    }

    /// Lists are copied as-is: no entry is dropped, deduplicated or reordered.
    pub fn assemble(&self) -> Configuration {
        let p = &self.preferences;
        Configuration {
            resolutions: p.resolutions.clone(),
            qualities: p.qualities.clone(),
            visual_tags: p.visual_tags.clone(),
            audio_tags: p.audio_tags.clone(),
            encodes: p.encodes.clone(),
            sort_by: p.sort_by.clone(),
            only_show_cached_streams: p.only_show_cached_streams,
            prioritised_languages: p.prioritised_languages.clone(),
            excluded_languages: p.excluded_languages.clone(),
            max_movie_size: p.max_movie_size,
            min_movie_size: p.min_movie_size,
            max_episode_size: p.max_episode_size,
            min_episode_size: p.min_episode_size,
            addon_name_in_description: p.addon_name_in_description,
            clean_results: p.clean_results,
            max_results_per_resolution: p.max_results_per_resolution,
            formatter: p
                .formatter
                .as_deref()
                .filter(|f| !f.is_empty())
                .unwrap_or(DEFAULT_FORMATTER)
                .to_owned(),
            media_flow_config: p.media_flow_config.clone(),
            addons: p.addons.clone(),
            services: p.services.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error_code: None,
            error_message: None,
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }
}

pub trait ConfigValidator: Send + Sync {
    fn validate(&self, config: &Configuration) -> Validation;
}

impl<F> ConfigValidator for F
where
    F: Fn(&Configuration) -> Validation + Send + Sync,
{
    fn validate(&self, config: &Configuration) -> Validation {
        self(config)
    }
}

/// Semantic checks applied before any link is generated.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardValidator;

impl ConfigValidator for StandardValidator {
    fn validate(&self, config: &Configuration) -> Validation {
        if config.addons.is_empty() {
            return Validation::rejected("noAddons", "Please add at least one addon");
        }
        if !ALLOWED_FORMATTERS.contains(&config.formatter.as_str()) {
            return Validation::rejected(
                "invalidFormatter",
                format!("Invalid formatter: {}", config.formatter),
            );
        }
        if let (Some(min), Some(max)) = (config.min_movie_size, config.max_movie_size)
            && min > max
        {
            return Validation::rejected(
                "invalidMovieSizeRange",
                "Minimum movie size cannot be greater than maximum movie size",
            );
        }
        if let (Some(min), Some(max)) = (config.min_episode_size, config.max_episode_size)
            && min > max
        {
            return Validation::rejected(
                "invalidEpisodeSizeRange",
                "Minimum episode size cannot be greater than maximum episode size",
            );
        }
        if config.max_results_per_resolution == Some(0) {
            return Validation::rejected(
                "invalidMaxResults",
                "Max results per resolution must be at least 1",
            );
        }
        let proxy = &config.media_flow_config;
        if proxy.media_flow_enabled {
            if proxy.proxy_url.trim().is_empty() {
                return Validation::rejected("missingProxyUrl", "MediaFlow proxy URL is required");
            }
            if proxy.api_password.trim().is_empty() {
                return Validation::rejected(
                    "missingProxyPassword",
                    "MediaFlow API password is required",
                );
            }
        }
        Validation::ok()
    }
}

/// Token standing for a configuration inside one URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedSegment(String);

impl EncodedSegment {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EncodedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn canonical_form<T: Serialize + ?Sized>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Reversible, non-confidential encoding used when the encryption service
/// is unavailable. URL-safe alphabet keeps the token a single path segment.
pub fn encode_local(canonical: &str) -> EncodedSegment {
    EncodedSegment(URL_SAFE.encode(canonical.as_bytes()))
}

pub fn decode_local(segment: &str) -> Result<Configuration, CoreError> {
    let bytes = URL_SAFE
        .decode(segment)
        .or_else(|_| STANDARD.decode(segment))
        .map_err(|err| CoreError::InvalidSegment(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| CoreError::InvalidSegment(err.to_string()))
}

/// Short digest of a canonical form, for correlating log lines without
/// logging credentials.
pub fn fingerprint(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[0..8])
}

/// `protocol` keeps its trailing colon, `host` may carry a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub protocol: String,
    pub host: String,
}

impl Origin {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
        }
    }

    pub fn parse(origin: &str) -> Result<Self, CoreError> {
        let url = Url::parse(origin).map_err(|err| CoreError::InvalidOrigin(err.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| CoreError::InvalidOrigin(format!("{origin} has no host")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        Ok(Self::new(format!("{}:", url.scheme()), host))
    }

    pub fn base_url(&self) -> String {
        format!("{}//{}", self.protocol, self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestUrl(String);

impl ManifestUrl {
    pub fn build(origin: &Origin, segment: &EncodedSegment) -> Self {
        Self(format!(
            "{}//{}/{}/{}",
            origin.protocol, origin.host, segment, MANIFEST_FILE_NAME
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replaces a leading `http`/`https` scheme name with `scheme`.
    pub fn with_scheme(&self, scheme: &str) -> String {
        let rest = self
            .0
            .strip_prefix("https")
            .or_else(|| self.0.strip_prefix("http"));
        match rest {
            Some(rest) => format!("{scheme}{rest}"),
            None => self.0.clone(),
        }
    }

    pub fn web_install_url(&self, entry: &str) -> String {
        format!("{entry}{}", utf8_percent_encode(&self.0, URI_COMPONENT))
    }
}

impl fmt::Display for ManifestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ManifestUrl> for String {
    fn from(url: ManifestUrl) -> Self {
        url.0
    }
}

/// Uniform result of every stage that can fail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub manifest: Option<String>,
    pub message: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(manifest: impl Into<String>) -> Self {
        Self {
            success: true,
            manifest: Some(manifest.into()),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            manifest: None,
            message: Some(message.into()),
        }
    }

    /// Failure that still produced a usable link.
    pub fn undelivered(manifest: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            manifest: Some(manifest.into()),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPhase {
    Loading,
    Success,
    Error,
    Warning,
    Info,
}

impl NotificationPhase {
    pub fn auto_closes(self) -> bool {
        !matches!(self, NotificationPhase::Loading)
    }
}

impl fmt::Display for NotificationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationPhase::Loading => "loading",
            NotificationPhase::Success => "success",
            NotificationPhase::Error => "error",
            NotificationPhase::Warning => "warning",
            NotificationPhase::Info => "info",
        };
        f.write_str(label)
    }
}
