use crate::convert::{RuleSpec, RuleTable, COPY, DECODABLE};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Config file name inside the target root.
pub const CONFIG_FILE: &str = "audiosync.toml";

/// Run log, WARN and above, inside the target root.
pub const LOG_FILE: &str = "audiosync.log";

/// Per-file encoder logs, inside the target root.
pub const ERROR_DIR: &str = ".audiosync-errors";

const ENV_PREFIX: &str = "AUDIOSYNC";

/// The config file as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Source library root (relative paths are resolved against the config file)
    pub source_dir: PathBuf,

    /// Glob patterns, relative to the source root, to leave out of the mirror
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    /// Number of concurrent conversions (0 or unset = CPU count)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Number of directories listed at the same time while scanning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_concurrency: Option<usize>,

    /// Encoder program
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder: Option<String>,

    /// Start time of the last run that completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,

    /// Set while a run is modifying the target
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub work_in_progress: bool,

    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl ConfigFile {
    /// Config suggested for a new mirror of `source_dir`.
    ///
    /// Lossless files found in the library are converted to mp3, lossy ones copied.
    pub fn starter(source_dir: &Path) -> Self {
        let mut suffixes: BTreeMap<String, usize> = BTreeMap::new();
        for entry in WalkDir::new(source_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if let Some(ext) = entry.path().extension() {
                *suffixes.entry(ext.to_string_lossy().to_lowercase()).or_default() += 1;
            }
        }

        for (suffix, count) in &suffixes {
            info!("Found {} .{} files", count, suffix);
        }

        let mut rules: Vec<RuleSpec> = suffixes
            .keys()
            .filter(|s| DECODABLE.contains(&s.as_str()))
            .map(|s| match s.as_str() {
                "flac" | "wav" | "aiff" => RuleSpec::new(s, Some("mp3"), Some("vbr:2")),
                _ => RuleSpec::new(s, None, Some(COPY)),
            })
            .collect();

        if rules.is_empty() {
            rules.push(RuleSpec::new("flac", Some("mp3"), Some("vbr:2")));
            rules.push(RuleSpec::new("mp3", None, Some(COPY)));
        }

        Self {
            source_dir: source_dir.to_path_buf(),
            exclude: Vec::new(),
            workers: None,
            scan_concurrency: None,
            encoder: None,
            last_sync: None,
            work_in_progress: false,
            rules,
        }
    }
}

/// Validated configuration for one run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Where the config is persisted
    pub path: PathBuf,

    pub source_dir: PathBuf,

    pub target_dir: PathBuf,

    /// Absolute source paths matched by the exclusion patterns
    pub excluded: HashSet<PathBuf>,

    pub workers: usize,

    pub scan_concurrency: usize,

    pub encoder: String,

    pub last_sync: Option<DateTime<Utc>>,

    pub work_in_progress: bool,

    pub rules: RuleTable,

    /// On-disk form, without environment overrides, written back by `save`
    persisted: ConfigFile,
}

impl SyncConfig {
    /// Load the config file at `path`, layering `AUDIOSYNC_*` environment overrides.
    pub fn load(path: &Path, target_dir: &Path) -> Result<Self, ConfigError> {
        let read = |with_env: bool| -> Result<ConfigFile, ConfigError> {
            let mut builder = config::Config::builder()
                .add_source(config::File::from(path).format(config::FileFormat::Toml));
            if with_env {
                builder = builder.add_source(
                    config::Environment::with_prefix(ENV_PREFIX)
                        .try_parsing(true)
                        .ignore_empty(true),
                );
            }
            builder
                .build()
                .and_then(|c| c.try_deserialize::<ConfigFile>())
                .map_err(|e| ConfigError::Load {
                    path: path.to_path_buf(),
                    source: e,
                })
        };

        let effective = read(true)?;
        let persisted = read(false)?;

        let mut config = Self::from_file(effective, path, target_dir)?;
        config.persisted = persisted;
        Ok(config)
    }

    /// Validate a parsed config file.
    pub fn from_file(
        file: ConfigFile,
        path: &Path,
        target_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let source_dir = if file.source_dir.is_absolute() {
            file.source_dir.clone()
        } else {
            base.join(&file.source_dir)
        };

        if !source_dir.is_dir() {
            return Err(ConfigError::MissingSource(source_dir));
        }
        if !target_dir.is_dir() {
            return Err(ConfigError::MissingTarget(target_dir.to_path_buf()));
        }

        let rules = RuleTable::from_specs(&file.rules)?;
        if rules.is_empty() {
            warn!("No conversion rules configured, nothing will be mirrored");
        }

        let excluded = expand_exclusions(&source_dir, &file.exclude)?;

        let workers = match file.workers {
            Some(n) if n > 0 => n,
            _ => num_cpus::get(),
        };
        let scan_concurrency = match file.scan_concurrency {
            Some(n) if n > 0 => n,
            _ => 8,
        };

        Ok(Self {
            path: path.to_path_buf(),
            source_dir,
            target_dir: target_dir.to_path_buf(),
            excluded,
            workers,
            scan_concurrency,
            encoder: file.encoder.clone().unwrap_or_else(|| "ffmpeg".to_string()),
            last_sync: file.last_sync,
            work_in_progress: file.work_in_progress,
            rules,
            persisted: file,
        })
    }

    pub fn set_work_in_progress(&mut self, wip: bool) {
        self.work_in_progress = wip;
        self.persisted.work_in_progress = wip;
    }

    pub fn set_last_sync(&mut self, at: DateTime<Utc>) {
        self.last_sync = Some(at);
        self.persisted.last_sync = Some(at);
    }

    /// Write the config back, replacing the file atomically.
    pub fn save(&self) -> Result<(), ConfigError> {
        write_config(&self.path, &self.persisted)
    }

    pub fn error_dir(&self) -> PathBuf {
        self.target_dir.join(ERROR_DIR)
    }

    pub fn log_file(&self) -> PathBuf {
        self.target_dir.join(LOG_FILE)
    }

    /// Entries of the target root that belong to audiosync itself.
    pub fn reserved_names(&self) -> Vec<String> {
        let mut names = vec![
            CONFIG_FILE.to_string(),
            LOG_FILE.to_string(),
            ERROR_DIR.to_string(),
        ];
        if self.path.parent() == Some(self.target_dir.as_path()) {
            if let Some(name) = self.path.file_name() {
                let name = name.to_string_lossy().into_owned();
                names.push(format!("{}.tmp", name));
                names.push(name);
            }
        }
        names
    }
}

/// Serialize `file` to `path` through a temporary sibling.
pub fn write_config(path: &Path, file: &ConfigFile) -> Result<(), ConfigError> {
    let text = toml::to_string_pretty(file)?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let io_err = |e| ConfigError::Write {
        path: path.to_path_buf(),
        source: e,
    };
    std::fs::write(&tmp, text).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    debug!("Saved config to {}", path.display());
    Ok(())
}

fn expand_exclusions(
    source_dir: &Path,
    patterns: &[String],
) -> Result<HashSet<PathBuf>, ConfigError> {
    let mut excluded = HashSet::new();
    // Library folders often contain brackets, which are glob syntax.
    let root = glob::Pattern::escape(&source_dir.to_string_lossy());

    for pattern in patterns {
        let full = format!("{}/{}", root, pattern.trim_start_matches('/'));
        let paths = glob::glob(&full).map_err(|e| ConfigError::Pattern {
            pattern: pattern.clone(),
            source: e,
        })?;
        let mut matched = 0;
        for path in paths {
            match path {
                Ok(p) => {
                    excluded.insert(p);
                    matched += 1;
                }
                Err(e) => warn!("Skipping unreadable path while expanding '{}': {}", pattern, e),
            }
        }
        debug!("Exclusion '{}' matched {} paths", pattern, matched);
    }

    Ok(excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn load_resolves_and_validates() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::create_dir_all(source.path().join("Podcasts/2020")).unwrap();
        std::fs::create_dir_all(source.path().join("Rock")).unwrap();

        let path = write(
            target.path(),
            &format!(
                r#"
source_dir = "{}"
exclude = ["Podcasts"]
workers = 3
last_sync = "2024-03-01T10:00:00Z"

[[rules]]
source = "flac"
target = "mp3"
conversion = "VBR"

[[rules]]
source = "mp3"
"#,
                source.path().display()
            ),
        );

        let config = SyncConfig::load(&path, target.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.scan_concurrency, 8);
        assert_eq!(config.encoder, "ffmpeg");
        assert!(!config.work_in_progress);
        assert_eq!(
            config.last_sync.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
        assert!(config.excluded.contains(&source.path().join("Podcasts")));
        assert!(!config.excluded.contains(&source.path().join("Rock")));
        assert_eq!(config.rules.lookup("a.flac").unwrap().conversion, "vbr:2");
        assert!(config.rules.lookup("a.mp3").unwrap().is_copy());
    }

    #[test]
    fn missing_source_is_fatal() {
        let target = TempDir::new().unwrap();
        let path = write(target.path(), "source_dir = \"/definitely/not/here\"\n");
        let err = SyncConfig::load(&path, target.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSource(_)));
    }

    #[test]
    fn malformed_rule_is_fatal() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let path = write(
            target.path(),
            &format!(
                "source_dir = \"{}\"\n[[rules]]\nsource = \"flac\"\ntarget = \"mp3\"\n",
                source.path().display()
            ),
        );
        assert!(matches!(
            SyncConfig::load(&path, target.path()),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn save_round_trips_state() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let path = write(
            target.path(),
            &format!(
                "source_dir = \"{}\"\n[[rules]]\nsource = \"mp3\"\n",
                source.path().display()
            ),
        );

        let mut config = SyncConfig::load(&path, target.path()).unwrap();
        let at = "2025-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap();
        config.set_work_in_progress(true);
        config.set_last_sync(at);
        config.save().unwrap();

        let reloaded = SyncConfig::load(&path, target.path()).unwrap();
        assert!(reloaded.work_in_progress);
        assert_eq!(reloaded.last_sync, Some(at));
        assert!(!target.path().join("audiosync.toml.tmp").exists());

        let mut config = reloaded;
        config.set_work_in_progress(false);
        config.save().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("work_in_progress"));
    }

    #[test]
    fn starter_config_matches_library() {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("a.flac"), b"x").unwrap();
        std::fs::write(source.path().join("b.ogg"), b"x").unwrap();
        std::fs::write(source.path().join("cover.jpg"), b"x").unwrap();

        let file = ConfigFile::starter(source.path());
        assert_eq!(
            file.rules,
            vec![
                RuleSpec::new("flac", Some("mp3"), Some("vbr:2")),
                RuleSpec::new("ogg", None, Some("copy")),
            ]
        );
        assert!(RuleTable::from_specs(&file.rules).is_ok());
    }

    #[test]
    fn reserved_names_cover_config_and_logs() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let path = write(
            target.path(),
            &format!("source_dir = \"{}\"\n", source.path().display()),
        );
        let config = SyncConfig::load(&path, target.path()).unwrap();
        let names = config.reserved_names();
        assert!(names.contains(&CONFIG_FILE.to_string()));
        assert!(names.contains(&LOG_FILE.to_string()));
        assert!(names.contains(&ERROR_DIR.to_string()));
    }
}
