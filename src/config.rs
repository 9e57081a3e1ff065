use serde::Deserialize;
use serde_json::{Map, Value};
use std::{collections::BTreeSet, env, fmt, fs, path::PathBuf, sync::Arc};

use crate::actor::IsolationMode;
use crate::discovery::{DirExtractor, Extractor};
use crate::error::{EngineError, EngineResult};

pub const DEFAULT_KIND: &str = "regression";

/// Run options as written in `steprun.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunOptions {
    /// Application names and class tags to exclude.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub kind: Option<String>,
    /// Directories scanned by a [`DirExtractor`] each.
    #[serde(default)]
    pub test_dirs: Vec<PathBuf>,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default = "default_thread_isolation")]
    pub use_thread_isolation: bool,
    #[serde(default)]
    pub failfast: bool,
}

fn default_verbosity() -> u8 {
    1
}

fn default_thread_isolation() -> bool {
    true
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            kind: None,
            test_dirs: Vec::new(),
            verbosity: default_verbosity(),
            include_tags: Vec::new(),
            use_thread_isolation: default_thread_isolation(),
            failfast: false,
        }
    }
}

impl RunOptions {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let options: RunOptions = serde_json::from_str(raw)?;
        Ok(options.expanded())
    }

    /// Load options from the first config file found, if any.
    pub fn load() -> anyhow::Result<Option<Self>> {
        let Some(path) = resolve_config_path() else {
            return Ok(None);
        };
        let raw = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Could not read {}: {}", path.display(), e))?;
        Ok(Some(Self::from_json(&raw)?))
    }

    fn expanded(mut self) -> Self {
        self.tags = self.tags.iter().map(|t| expand_env_vars(t)).collect();
        self.include_tags = self.include_tags.iter().map(|t| expand_env_vars(t)).collect();
        self.test_dirs = self
            .test_dirs
            .iter()
            .map(|d| PathBuf::from(expand_env_vars(&d.to_string_lossy())))
            .collect();
        if let Some(kind) = self.kind.as_mut() {
            *kind = expand_env_vars(kind);
        }
        self
    }

    pub fn into_config(self) -> EngineResult<RunConfig> {
        let kind = self.kind.unwrap_or_else(|| DEFAULT_KIND.to_string());
        if kind.trim().is_empty() {
            return Err(EngineError::Config("kind must not be empty".to_string()));
        }
        let extractors = self
            .test_dirs
            .into_iter()
            .map(|dir| Arc::new(DirExtractor::new(dir)) as Arc<dyn Extractor>)
            .collect();
        Ok(RunConfig {
            tags: self.tags.into_iter().collect(),
            kind,
            extractors,
            verbosity: self.verbosity,
            include_tags: self.include_tags.into_iter().collect(),
            isolation: IsolationMode::from_thread_flag(self.use_thread_isolation),
            failfast: self.failfast,
        })
    }
}

/// Immutable configuration of one run.
#[derive(Clone)]
pub struct RunConfig {
    pub tags: BTreeSet<String>,
    pub kind: String,
    pub extractors: Vec<Arc<dyn Extractor>>,
    /// 1 errors only, 2 info, 3 debug; anything else is silent.
    pub verbosity: u8,
    pub include_tags: BTreeSet<String>,
    pub isolation: IsolationMode,
    pub failfast: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tags: BTreeSet::new(),
            kind: DEFAULT_KIND.to_string(),
            extractors: Vec::new(),
            verbosity: default_verbosity(),
            include_tags: BTreeSet::new(),
            isolation: IsolationMode::Thread,
            failfast: false,
        }
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("tags", &self.tags)
            .field("kind", &self.kind)
            .field("extractors", &self.extractors.len())
            .field("verbosity", &self.verbosity)
            .field("include_tags", &self.include_tags)
            .field("isolation", &self.isolation)
            .field("failfast", &self.failfast)
            .finish()
    }
}

/// Per-application overrides accepted by `load_config`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RunOverrides {
    tags: Option<Vec<String>>,
    kind: Option<String>,
    verbosity: Option<u8>,
    include_tags: Option<Vec<String>>,
    failfast: Option<bool>,
}

impl RunConfig {
    /// Apply the keys present in `options` on top of this configuration.
    pub fn apply_overrides(&mut self, options: &Map<String, Value>) -> EngineResult<()> {
        if options.is_empty() {
            return Ok(());
        }
        let overrides: RunOverrides = serde_json::from_value(Value::Object(options.clone()))
            .map_err(|e| EngineError::Config(e.to_string()))?;
        if let Some(tags) = overrides.tags {
            self.tags = tags.into_iter().collect();
        }
        if let Some(kind) = overrides.kind {
            self.kind = kind;
        }
        if let Some(verbosity) = overrides.verbosity {
            self.verbosity = verbosity;
        }
        if let Some(include_tags) = overrides.include_tags {
            self.include_tags = include_tags.into_iter().collect();
        }
        if let Some(failfast) = overrides.failfast {
            self.failfast = failfast;
        }
        Ok(())
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("STEPRUN_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("steprun").join("steprun.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("steprun.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}
