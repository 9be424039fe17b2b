use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
    #[error("Invalid extension '{0}': must be 1 to 5 ASCII letters")]
    InvalidExtension(String),
}

/// Extensions accepted when `ALLOWED_EXTENSIONS` is not set
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "gif", "png", "pdf", "doc", "txt"];

/// Longest accepted extension
pub const MAX_EXTENSION_LEN: usize = 5;

/// Default ceiling for a single file, in bytes
pub const DEFAULT_MAX_FILE_SIZE: u64 = 500_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub policy: UploadPolicy,
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Holds the reference database and the blob store
    pub data_dir: PathBuf,
    /// Root of the user-visible namespaces. Must already exist.
    pub target_dir: PathBuf,
}

impl StorageConfig {
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// `unix:///path` or `tcp://host:port`
    pub address: String,
    pub timeout_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            address: "unix:///var/run/clamav/clamd.ctl".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Rules applied to every upload.
///
/// Setters validate their input, so an invalid policy can never reach the
/// upload pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    allowed_extensions: BTreeSet<String>,
    max_file_size: u64,
    image_only: bool,
    scan_enabled: bool,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            image_only: false,
            scan_enabled: false,
        }
    }
}

impl UploadPolicy {
    /// Replace the allowed extensions. Entries are lower-cased and de-duplicated.
    pub fn set_allowed_extensions<I, S>(&mut self, extensions: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        for extension in extensions {
            let extension = extension.as_ref();
            if extension.is_empty()
                || extension.len() > MAX_EXTENSION_LEN
                || !extension.chars().all(|c| c.is_ascii_alphabetic())
            {
                return Err(ConfigError::InvalidExtension(extension.to_string()));
            }
            allowed.insert(extension.to_ascii_lowercase());
        }

        if allowed.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one allowed extension is required".to_string(),
            ));
        }

        self.allowed_extensions = allowed;
        Ok(())
    }

    pub fn set_max_file_size(&mut self, max_file_size: u64) -> Result<(), ConfigError> {
        if max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "max file size must be greater than 0".to_string(),
            ));
        }
        self.max_file_size = max_file_size;
        Ok(())
    }

    pub fn set_image_only(&mut self, image_only: bool) {
        self.image_only = image_only;
    }

    pub fn set_scan_enabled(&mut self, scan_enabled: bool) {
        self.scan_enabled = scan_enabled;
    }

    pub fn allowed_extensions(&self) -> &BTreeSet<String> {
        &self.allowed_extensions
    }

    pub fn is_allowed_extension(&self, extension: &str) -> bool {
        self.allowed_extensions
            .contains(&extension.to_ascii_lowercase())
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn image_only(&self) -> bool {
        self.image_only
    }

    pub fn scan_enabled(&self) -> bool {
        self.scan_enabled
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup. Unset keys take their defaults;
    /// set but unparseable values are errors.
    pub fn load_from<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_address = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let data_dir = var("DATA_DIR").unwrap_or_else(|| "./data".to_string());

        let target_dir = var("TARGET_DIR").unwrap_or_else(|| "./files".to_string());

        let mut policy = UploadPolicy::default();

        if let Some(extensions) = var("ALLOWED_EXTENSIONS") {
            policy.set_allowed_extensions(
                extensions
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
            )?;
        }

        if let Some(max) = var("MAX_FILE_SIZE") {
            policy.set_max_file_size(parse_u64("MAX_FILE_SIZE", &max)?)?;
        }

        if let Some(flag) = var("IMAGE_ONLY") {
            policy.set_image_only(parse_flag("IMAGE_ONLY", &flag)?);
        }
        if let Some(flag) = var("SCAN_ENABLED") {
            policy.set_scan_enabled(parse_flag("SCAN_ENABLED", &flag)?);
        }

        let defaults = ScannerConfig::default();
        let scanner = ScannerConfig {
            address: var("CLAMD_ADDRESS").unwrap_or(defaults.address),
            timeout_ms: match var("CLAMD_TIMEOUT_MS") {
                Some(timeout) => parse_u64("CLAMD_TIMEOUT_MS", &timeout)?,
                None => defaults.timeout_ms,
            },
        };

        let config = Config {
            node: NodeConfig { bind_address },
            storage: StorageConfig {
                data_dir: PathBuf::from(data_dir),
                target_dir: PathBuf::from(target_dir.trim()),
            },
            policy,
            scanner,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_target_dir(&self.storage.target_dir)?;
        validate_storage_layout(&self.storage)?;

        if self.policy.scan_enabled() {
            crate::scanner::ClamdAddress::parse(&self.scanner.address)?;
        }
        if self.scanner.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "CLAMD_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// The link root must be a visible, already existing directory.
/// It is never created on the operator's behalf.
pub fn validate_target_dir(target_dir: &Path) -> Result<(), ConfigError> {
    if target_dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "TARGET_DIR cannot be empty".to_string(),
        ));
    }

    let hidden = target_dir.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    });
    if hidden {
        return Err(ConfigError::ValidationError(format!(
            "TARGET_DIR '{}' must not be a hidden directory",
            target_dir.display()
        )));
    }

    if !target_dir.is_dir() {
        return Err(ConfigError::ValidationError(format!(
            "TARGET_DIR '{}' does not exist",
            target_dir.display()
        )));
    }

    Ok(())
}

/// The link root and the blob root must be disjoint, or a namespace could
/// shadow blob shards.
pub fn validate_storage_layout(storage: &StorageConfig) -> Result<(), ConfigError> {
    let target_dir = resolved(&storage.target_dir)?;
    let blob_dir = resolved(&storage.blob_dir())?;

    if target_dir.starts_with(&blob_dir) || blob_dir.starts_with(&target_dir) {
        return Err(ConfigError::ValidationError(format!(
            "TARGET_DIR '{}' overlaps the blob directory '{}'",
            storage.target_dir.display(),
            storage.blob_dir().display()
        )));
    }

    Ok(())
}

/// Absolute form of `path`, with `.` and `..` folded and symlinks resolved
/// up to the deepest ancestor that exists.
fn resolved(path: &Path) -> Result<PathBuf, ConfigError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| {
                ConfigError::ValidationError(format!("cannot resolve working directory: {e}"))
            })?
            .join(path)
    };
    let lexical = fold(PathBuf::new(), absolute.components());

    let mut existing = lexical.as_path();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return Ok(match lexical.strip_prefix(existing) {
                Ok(rest) if !rest.as_os_str().is_empty() => canonical.join(rest),
                _ => canonical,
            });
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return Ok(lexical),
        }
    }
}

fn fold<'a, I>(mut base: PathBuf, components: I) -> PathBuf
where
    I: IntoIterator<Item = Component<'a>>,
{
    for component in components {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                base.pop();
            }
            other => base.push(other.as_os_str()),
        }
    }
    base
}

/// Accepts `true`/`false`/`1`/`0`, case-insensitively.
fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::ValidationError(format!(
            "{name} '{value}' must be one of true, false, 1, 0"
        ))),
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| {
        ConfigError::ValidationError(format!("{name} '{value}' is not a positive integer"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = UploadPolicy::default();
        assert!(policy.is_allowed_extension("jpg"));
        assert!(policy.is_allowed_extension("PDF"));
        assert!(!policy.is_allowed_extension("exe"));
        assert_eq!(policy.max_file_size(), 500_000);
        assert!(!policy.image_only());
        assert!(!policy.scan_enabled());
    }

    #[test]
    fn test_extensions_are_normalized() {
        let mut policy = UploadPolicy::default();
        policy
            .set_allowed_extensions(["PNG", "png", "Jpg"])
            .unwrap();
        let allowed: Vec<&str> = policy
            .allowed_extensions()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(allowed, vec!["jpg", "png"]);
    }

    #[test]
    fn test_invalid_extensions_are_rejected() {
        let mut policy = UploadPolicy::default();
        for bad in ["", "tar.gz", "mp3", "toolong", ".png", "pn g"] {
            assert!(
                matches!(
                    policy.set_allowed_extensions([bad]),
                    Err(ConfigError::InvalidExtension(_))
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(policy.set_allowed_extensions(Vec::<String>::new()).is_err());

        // A failed update leaves the previous set untouched
        assert_eq!(policy, UploadPolicy::default());
    }

    #[test]
    fn test_max_file_size_must_be_positive() {
        let mut policy = UploadPolicy::default();
        assert!(policy.set_max_file_size(0).is_err());
        policy.set_max_file_size(1).unwrap();
        assert_eq!(policy.max_file_size(), 1);
    }

    #[test]
    fn test_validate_target_dir() {
        // The default tempdir prefix is itself hidden
        let dir = tempfile::Builder::new().prefix("cfg").tempdir().unwrap();
        let visible = dir.path().join("files");
        let hidden = dir.path().join(".files");
        std::fs::create_dir(&visible).unwrap();
        std::fs::create_dir(&hidden).unwrap();

        assert!(validate_target_dir(&visible).is_ok());
        assert!(validate_target_dir(&hidden).is_err());
        assert!(validate_target_dir(&dir.path().join("missing")).is_err());
        assert!(validate_target_dir(Path::new("")).is_err());
    }

    /// A visible temp dir with a `files` link root inside it
    fn layout() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::Builder::new().prefix("cfg").tempdir().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir(&files).unwrap();
        (dir, files)
    }

    fn load_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: std::collections::HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_load_defaults() {
        let (dir, files) = layout();
        let data = dir.path().join("data");
        let config = load_with(&[
            ("TARGET_DIR", files.to_str().unwrap()),
            ("DATA_DIR", data.to_str().unwrap()),
        ])
        .unwrap();

        assert_eq!(config.policy, UploadPolicy::default());
        assert_eq!(config.scanner.timeout_ms, 10_000);
        assert_eq!(config.node.bind_address, "0.0.0.0:8080");
    }

    #[test]
    fn test_flags_are_case_insensitive() {
        let (dir, files) = layout();
        let data = dir.path().join("data");
        let config = load_with(&[
            ("TARGET_DIR", files.to_str().unwrap()),
            ("DATA_DIR", data.to_str().unwrap()),
            ("SCAN_ENABLED", "TRUE"),
            ("IMAGE_ONLY", "1"),
        ])
        .unwrap();
        assert!(config.policy.scan_enabled());
        assert!(config.policy.image_only());

        let config = load_with(&[
            ("TARGET_DIR", files.to_str().unwrap()),
            ("DATA_DIR", data.to_str().unwrap()),
            ("SCAN_ENABLED", "False"),
            ("IMAGE_ONLY", "0"),
        ])
        .unwrap();
        assert!(!config.policy.scan_enabled());
        assert!(!config.policy.image_only());
    }

    #[test]
    fn test_unrecognized_flags_fail_to_load() {
        let (dir, files) = layout();
        let data = dir.path().join("data");
        for value in ["yes", "on", "enabled", ""] {
            let result = load_with(&[
                ("TARGET_DIR", files.to_str().unwrap()),
                ("DATA_DIR", data.to_str().unwrap()),
                ("SCAN_ENABLED", value),
            ]);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "SCAN_ENABLED={value:?} should be rejected"
            );
        }

        let result = load_with(&[
            ("TARGET_DIR", files.to_str().unwrap()),
            ("DATA_DIR", data.to_str().unwrap()),
            ("IMAGE_ONLY", "maybe"),
        ]);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_numeric_settings_fail_to_load() {
        let (dir, files) = layout();
        let data = dir.path().join("data");
        for (key, value) in [
            ("CLAMD_TIMEOUT_MS", "ten seconds"),
            ("CLAMD_TIMEOUT_MS", "-5"),
            ("CLAMD_TIMEOUT_MS", "0"),
            ("MAX_FILE_SIZE", "1MB"),
            ("MAX_FILE_SIZE", "0"),
        ] {
            let result = load_with(&[
                ("TARGET_DIR", files.to_str().unwrap()),
                ("DATA_DIR", data.to_str().unwrap()),
                (key, value),
            ]);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "{key}={value:?} should be rejected"
            );
        }

        let config = load_with(&[
            ("TARGET_DIR", files.to_str().unwrap()),
            ("DATA_DIR", data.to_str().unwrap()),
            ("CLAMD_TIMEOUT_MS", " 2500 "),
        ])
        .unwrap();
        assert_eq!(config.scanner.timeout_ms, 2500);
    }

    #[test]
    fn test_overlapping_storage_is_rejected() {
        let dir = tempfile::Builder::new().prefix("cfg").tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("blobs").join("links")).unwrap();

        // Links root is the data dir, so a `blobs` namespace would land in the blob root
        let shared = StorageConfig {
            data_dir: data.clone(),
            target_dir: data.clone(),
        };
        assert!(validate_storage_layout(&shared).is_err());

        let inside_blobs = StorageConfig {
            data_dir: data.clone(),
            target_dir: data.join("blobs").join("links"),
        };
        assert!(validate_storage_layout(&inside_blobs).is_err());

        // Same directory spelled through `..`
        let dotted = StorageConfig {
            data_dir: data.join("blobs").join("links").join("..").join(".."),
            target_dir: data.clone(),
        };
        assert!(validate_storage_layout(&dotted).is_err());

        let result = load_with(&[
            ("TARGET_DIR", data.to_str().unwrap()),
            ("DATA_DIR", data.to_str().unwrap()),
        ]);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_disjoint_storage_is_accepted() {
        let (dir, files) = layout();

        // The data dir does not have to exist yet
        let storage = StorageConfig {
            data_dir: dir.path().join("data"),
            target_dir: files.clone(),
        };
        assert!(validate_storage_layout(&storage).is_ok());

        // Sibling with a shared name prefix is not nested
        let storage = StorageConfig {
            data_dir: dir.path().join("files-data"),
            target_dir: files,
        };
        assert!(validate_storage_layout(&storage).is_ok());
    }
}
