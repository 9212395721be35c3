use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::SystemTime,
};

use clap::Parser;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};

fn camel_to_snake_case(input: &str) -> String {
    let mut snake = String::new();
    for (i, ch) in input.char_indices() {
        if i > 0 && ch.is_uppercase() {
            snake.push('_');
        }
        snake.push(ch.to_ascii_lowercase());
    }
    snake
}

fn short_type_name<T>() -> &'static str {
    type_name::<T>().rsplit("::").next().unwrap_or("unknown")
}

#[derive(Debug)]
pub enum ValidationError {
    Bounds,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ValidationError::Bounds => "bounds",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ValidationError {}

pub trait ConfigValue:
    'static + Send + Sync + Default + Clone + Serialize + DeserializeOwned
{
    const KEY: Option<&str> = None;
    const ENV_KEY: Option<&str> = None;
    const REQUIRE_RESTART: bool = false;

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SettingValue<T> {
    default: T,
    config: Option<T>,
    cli: Option<T>,
    env: Option<T>,
}

impl<T: ConfigValue> SettingValue<T> {
    pub fn new(val: T) -> Self {
        use std::env::var;
        let env = match T::ENV_KEY {
            Some(key) => Some(key.to_string()),
            None => Some(
                T::KEY
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| camel_to_snake_case(short_type_name::<T>()).to_uppercase()),
            ),
        }
        .and_then(|env_key| {
            let val = var(env_key).ok()?;
            match serde_plain::from_str(&val) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(
                        found = val,
                        "Found env value but could not parse it as {}. {e}",
                        type_name::<T>()
                    );
                    None
                }
            }
        });
        Self {
            default: val,
            config: None,
            cli: None,
            env,
        }
    }

    /// Setting value with respect to its source priority
    pub fn customized(&self) -> &T {
        self.cli
            .as_ref()
            .or(self.env.as_ref())
            .or(self.config.as_ref())
            .unwrap_or(&self.default)
    }
}

trait AnySettingValue: 'static + Send + Sync {
    fn key(&self) -> String;
    fn require_restart(&self) -> bool;
    fn type_name(&self) -> &'static str;

    fn customized_value(&self) -> &dyn Any;
    fn config_mut(&mut self) -> &mut dyn Any;
    fn cli_mut(&mut self) -> &mut dyn Any;
    fn reset_config_value(&mut self);

    fn serialize_config(&self) -> Option<toml::Value>;
    fn deserialize_toml(&mut self, from: toml::Value) -> Result<(), toml::de::Error>;
}

impl<T: ConfigValue> AnySettingValue for SettingValue<T> {
    fn key(&self) -> String {
        T::KEY
            .map(|k| k.to_string())
            .unwrap_or_else(|| camel_to_snake_case(self.type_name()))
    }

    fn require_restart(&self) -> bool {
        T::REQUIRE_RESTART
    }

    fn type_name(&self) -> &'static str {
        short_type_name::<T>()
    }

    fn deserialize_toml(&mut self, from: toml::Value) -> Result<(), toml::de::Error> {
        let value = T::deserialize(from)?;
        self.config = Some(value);
        Ok(())
    }

    fn serialize_config(&self) -> Option<toml::Value> {
        let value = self.config.clone();
        Some(toml::Value::try_from(value?).unwrap())
    }

    fn customized_value(&self) -> &dyn Any {
        self.customized()
    }

    fn config_mut(&mut self) -> &mut dyn Any {
        &mut self.config
    }

    fn cli_mut(&mut self) -> &mut dyn Any {
        &mut self.cli
    }

    fn reset_config_value(&mut self) {
        self.config = None;
    }
}

pub static CONFIG: LazyLock<ConfigStore> = LazyLock::new(ConfigStore::construct);

#[derive(Clone)]
pub struct ConfigStore {
    settings: watch::Sender<HashMap<TypeId, Box<dyn AnySettingValue>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish()
    }
}

impl ConfigStore {
    pub fn construct() -> Self {
        let store = Self::new();

        store.register_value::<Port>();
        store.register_value::<SourceLanguages>();
        store.register_value::<TargetLanguages>();
        store.register_value::<OpensubtitlesEnabled>();
        store.register_value::<OpensubtitlesApiKey>();
        store.register_value::<SubdlEnabled>();
        store.register_value::<SubdlApiKey>();
        store.register_value::<SubsourceEnabled>();
        store.register_value::<GeminiKey>();
        store.register_value::<GeminiModel>();
        store.register_value::<TranslationCacheEnabled>();
        store.register_value::<TranslationCacheSizeGb>();
        store.register_value::<BypassCacheEnabled>();
        store.register_value::<BypassCacheDurationHours>();
        store.register_value::<MinSubtitleSizeBytes>();
        store.register_value::<EnableSeasonPacks>();
        store.register_value::<ExcludeHearingImpaired>();
        store.register_value::<SearchTimeoutSecs>();
        store.register_value::<DownloadTimeoutSecs>();
        store.register_value::<ActionEntriesEnabled>();

        store
    }

    pub fn new() -> Self {
        let (settings_tx, _) = watch::channel(HashMap::new());
        Self {
            settings: settings_tx,
        }
    }

    pub fn register_value<T: ConfigValue>(&self) {
        let default = T::default();
        self.settings.send_modify(|setting| {
            setting.insert(TypeId::of::<T>(), Box::new(SettingValue::new(default)));
        });
    }

    pub fn get_value<T: ConfigValue>(&self) -> T {
        let settings = self.settings.borrow();
        let setting = settings
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| panic!("unregistered setting type {}", type_name::<T>()));
        let t: &T = setting.customized_value().downcast_ref().unwrap();
        t.clone()
    }

    pub fn update_value<T: ConfigValue>(&self, new: T) {
        self.settings.send_modify(|settings| {
            let setting = settings
                .get_mut(&TypeId::of::<T>())
                .unwrap_or_else(|| panic!("unregistered setting type {}", type_name::<T>()));
            let value = setting.config_mut();
            let value = value.downcast_mut().unwrap();
            *value = Some(new);
        });
    }

    pub fn construct_table(&self) -> toml::Table {
        let mut table = toml::Table::new();
        let settings = self.settings.borrow();
        for setting in settings.values() {
            let Some(value) = setting.serialize_config() else {
                continue;
            };
            table.insert(setting.key(), value);
        }
        table
    }

    pub fn apply_toml_settings(&self, table: toml::Table) {
        self.settings.send_modify(|settings| {
            for setting in settings.values_mut() {
                let key = setting.key();
                if let Some(val) = table.get(&key).cloned() {
                    if let Err(err) = setting.deserialize_toml(val) {
                        tracing::warn!(
                            "Failed to deserialize toml value for {}: {err}",
                            setting.type_name()
                        )
                    };
                }
            }
        });
    }

    pub fn apply_cli_value<T: ConfigValue>(&self, value: T) {
        self.settings.send_modify(|settings| {
            let setting = settings.get_mut(&value.type_id()).unwrap();
            let setting = setting.cli_mut();
            let val = setting.downcast_mut().unwrap();
            *val = Some(value);
        });
    }

    pub fn reset_config_values(&self) {
        self.settings.send_modify(|settings| {
            for setting in settings.values_mut() {
                setting.reset_config_value();
            }
        });
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

// Settings

/// The network port on which the server listens for incoming connections
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct Port(pub u16);

impl Default for Port {
    fn default() -> Self {
        Self(7070)
    }
}

impl ConfigValue for Port {
    const REQUIRE_RESTART: bool = true;
}

/// Languages the viewer reads directly. Real subtitles in these languages
/// are listed, and they double as translation sources
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceLanguages(pub Vec<String>);
impl ConfigValue for SourceLanguages {}
impl Default for SourceLanguages {
    fn default() -> Self {
        Self(vec!["eng".to_string()])
    }
}

/// Languages translation pseudo-entries are offered for
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TargetLanguages(pub Vec<String>);
impl ConfigValue for TargetLanguages {}

/// Enable the OpenSubtitles provider
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct OpensubtitlesEnabled(pub bool);
impl ConfigValue for OpensubtitlesEnabled {}
impl Default for OpensubtitlesEnabled {
    fn default() -> Self {
        Self(true)
    }
}

/// API key for OpenSubtitles. Without it the provider runs in anonymous
/// mode with the shared download quota
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OpensubtitlesApiKey(pub Option<String>);
impl ConfigValue for OpensubtitlesApiKey {
    const ENV_KEY: Option<&str> = Some("OPENSUBTITLES_API_KEY");
}

/// Enable the SubDL provider
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct SubdlEnabled(pub bool);
impl ConfigValue for SubdlEnabled {}

/// API key for SubDL
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SubdlApiKey(pub Option<String>);
impl ConfigValue for SubdlApiKey {
    const ENV_KEY: Option<&str> = Some("SUBDL_API_KEY");
}

/// Enable the SubSource provider
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct SubsourceEnabled(pub bool);
impl ConfigValue for SubsourceEnabled {}

/// API key for the Gemini translation backend
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct GeminiKey(pub Option<String>);
impl ConfigValue for GeminiKey {
    const ENV_KEY: Option<&str> = Some("GEMINI_API_KEY");
}

/// Gemini model used for translations
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeminiModel(pub String);
impl ConfigValue for GeminiModel {}
impl Default for GeminiModel {
    fn default() -> Self {
        Self("gemini-2.5-flash".to_string())
    }
}

/// Keep finished translations on disk and serve them to everyone
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct TranslationCacheEnabled(pub bool);
impl ConfigValue for TranslationCacheEnabled {}
impl Default for TranslationCacheEnabled {
    fn default() -> Self {
        Self(true)
    }
}

/// Soft size cap for the permanent translation cache, in GiB
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct TranslationCacheSizeGb(pub u64);
impl ConfigValue for TranslationCacheSizeGb {}
impl Default for TranslationCacheSizeGb {
    fn default() -> Self {
        Self(50)
    }
}

/// Keep translations in a short lived per-user cache instead of the
/// permanent one
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct BypassCacheEnabled(pub bool);
impl ConfigValue for BypassCacheEnabled {}

/// Lifetime of bypass cache entries, in hours
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct BypassCacheDurationHours(pub u64);
impl ConfigValue for BypassCacheDurationHours {}
impl Default for BypassCacheDurationHours {
    fn default() -> Self {
        Self(12)
    }
}

/// Downloads smaller than this many bytes are treated as broken
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct MinSubtitleSizeBytes(pub u64);
impl ConfigValue for MinSubtitleSizeBytes {}
impl Default for MinSubtitleSizeBytes {
    fn default() -> Self {
        Self(200)
    }
}

/// Offer subtitles that cover a whole season for episode requests
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct EnableSeasonPacks(pub bool);
impl ConfigValue for EnableSeasonPacks {}

/// Hide hearing impaired subtitles from listings
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct ExcludeHearingImpaired(pub bool);
impl ConfigValue for ExcludeHearingImpaired {}

/// Per-provider search timeout in seconds
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct SearchTimeoutSecs(pub u64);
impl ConfigValue for SearchTimeoutSecs {}
impl Default for SearchTimeoutSecs {
    fn default() -> Self {
        Self(12)
    }
}

/// Per-provider download timeout in seconds
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct DownloadTimeoutSecs(pub u64);
impl ConfigValue for DownloadTimeoutSecs {}
impl Default for DownloadTimeoutSecs {
    fn default() -> Self {
        Self(18)
    }
}

/// Append action pseudo-entries (Sync Subtitles, Translate SRT) to
/// subtitle listings
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct ActionEntriesEnabled(pub bool);
impl ConfigValue for ActionEntriesEnabled {}

#[derive(Debug)]
pub struct ConfigFile(pub fs::File);

impl ConfigFile {
    pub async fn open(config_path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        if let Some(parent) = config_path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config_path)
            .await?;
        tracing::debug!("Opened config file {}", config_path.as_ref().display());
        Ok(Self(file))
    }

    /// Open and read config file dropping file handle.
    pub async fn open_and_read() -> anyhow::Result<toml::Table> {
        let mut config = Self::open(&APP_RESOURCES.config_path).await?;
        config.read().await
    }

    /// Read config file
    pub async fn read(&mut self) -> Result<toml::Table, anyhow::Error> {
        let mut raw = String::new();
        let read = self.0.read_to_string(&mut raw).await?;
        tracing::debug!("Read {read} bytes from config file");
        let table: toml::Table = toml::from_str(&raw)?;
        Ok(table)
    }

    /// Write config file
    pub async fn write_toml(&mut self, table: toml::Table) -> Result<(), anyhow::Error> {
        self.0.set_len(0).await?;
        let raw = toml::to_string_pretty(&table)?;
        self.0.write_all(raw.as_bytes()).await?;
        Ok(())
    }
}

#[derive(Debug, Parser, Deserialize, Serialize)]
#[command(version)]
pub struct Args {
    /// Override port
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Override gemini api key
    #[arg(long)]
    pub gemini_key: Option<String>,
}

impl Args {
    pub fn apply_configuration(self) {
        if let Some(port) = self.port {
            CONFIG.apply_cli_value(Port(port));
        }
        if let Some(key) = self.gemini_key {
            CONFIG.apply_cli_value(GeminiKey(Some(key)));
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppResources {
    pub start_time: SystemTime,
    #[serde(skip)]
    pub config_path: PathBuf,
    pub cache_path: PathBuf,
    pub temp_path: PathBuf,
    pub log_path: PathBuf,
    pub app_version: &'static str,
}

pub static APP_RESOURCES: LazyLock<AppResources> = LazyLock::new(AppResources::new);

impl AppResources {
    pub const APP_NAME: &'static str = "subtitle-server";

    fn data_storage() -> PathBuf {
        if Self::is_prod() {
            dirs::data_local_dir()
                .expect("target to have data directory")
                .join(Self::APP_NAME)
        } else {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        }
    }

    pub fn is_prod() -> bool {
        !cfg!(debug_assertions)
    }

    pub fn default_config_path() -> PathBuf {
        if Self::is_prod() {
            dirs::config_local_dir()
                .expect("target supports config dir")
                .join(Self::APP_NAME)
        } else {
            Self::data_storage()
        }
        .join("configuration.toml")
    }

    fn temp_storage() -> PathBuf {
        Self::data_storage().join("tmp")
    }

    fn cache_storage() -> PathBuf {
        Self::data_storage().join("cache")
    }

    pub fn log() -> PathBuf {
        Self::data_storage().join("log.log")
    }

    pub fn initiate() -> Result<(), std::io::Error> {
        use std::fs;
        fs::create_dir_all(Self::cache_storage())?;
        fs::create_dir_all(Self::temp_storage())?;
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(Self::log())?;
        Ok(())
    }

    pub fn new() -> Self {
        let start_time = SystemTime::now();
        let config_path = Self::default_config_path();
        let cache_path = Self::cache_storage();
        let temp_path = Self::temp_storage();
        let log_path = Self::log();
        let app_version = std::env!("CARGO_PKG_VERSION");

        tracing::debug!(path = %config_path.display(), "Selected config path");
        tracing::debug!(path = %cache_path.display(), "Selected cache path");
        tracing::debug!(path = %temp_path.display(), "Selected tmp path");
        tracing::debug!(path = %log_path.display(), "Selected log path");
        tracing::info!("Server version: {app_version}");

        Self {
            start_time,
            config_path,
            cache_path,
            temp_path,
            log_path,
            app_version,
        }
    }
}

impl Default for AppResources {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {

    use super::{ConfigStore, MinSubtitleSizeBytes, Port, SourceLanguages};

    const TEST_TOML_CONFIG: &str = r#"
port = 8000
min_subtitle_size_bytes = 512
source_languages = ["eng", "spa"]
    "#;

    #[test]
    fn setting_store() {
        let store = ConfigStore::construct();
        let mut port = Port::default();
        let stored_port: Port = store.get_value();
        assert_eq!(port, stored_port);
        port = Port(8000);
        store.update_value(port);
        let stored_port: Port = store.get_value();
        assert_eq!(port, stored_port);
    }

    #[test]
    fn apply_settings() {
        let store = ConfigStore::construct();
        let port: Port = store.get_value();
        assert_eq!(port.0, Port::default().0);
        let toml = toml::from_str(TEST_TOML_CONFIG).unwrap();
        store.apply_toml_settings(toml);
        let port: Port = store.get_value();
        let min_size: MinSubtitleSizeBytes = store.get_value();
        let languages: SourceLanguages = store.get_value();
        assert_eq!(port.0, 8000);
        assert_eq!(min_size.0, 512);
        assert_eq!(languages.0, vec!["eng", "spa"]);
    }

    #[test]
    fn reset_clears_config_layer() {
        let store = ConfigStore::construct();
        let toml = toml::from_str("port = 9000").unwrap();
        store.apply_toml_settings(toml);
        let port: Port = store.get_value();
        assert_eq!(port.0, 9000);
        store.reset_config_values();
        let port: Port = store.get_value();
        assert_eq!(port.0, Port::default().0);
    }
}
