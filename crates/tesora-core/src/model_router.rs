//! Model Router for task-based model selection
//!
//! Each pipeline step that calls an AI backend is a task with its own model,
//! timeout, and output token budget. Consecutive failures mark a model
//! unhealthy and route to the fallback until the recovery wait passes.
//!
//! ## Configuration Resolution
//!
//! 1. Override in data dir (~/.local/share/tesora/config/models.toml)
//! 2. Embedded defaults (compiled into binary)

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/models.toml");

/// Pipeline steps that call an AI backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Header count and column description of an unknown statement
    LayoutInference,
    /// Statement lines to transaction rows
    Extraction,
    /// Transaction rows to ledger accounts
    Classification,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LayoutInference => "layout_inference",
            Self::Extraction => "extraction",
            Self::Classification => "classification",
        }
    }

    pub fn all() -> &'static [TaskType] {
        &[Self::LayoutInference, Self::Extraction, Self::Classification]
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "layout_inference" => Ok(Self::LayoutInference),
            "extraction" => Ok(Self::Extraction),
            "classification" => Ok(Self::Classification),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Configuration for a specific task type
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Output token cap; hitting it truncates the response
    pub max_tokens: u32,
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_model: String,
    pub default_timeout: Duration,
    pub default_retries: u32,
    pub default_max_tokens: u32,
    pub fallback_model: Option<String>,
    pub tasks: HashMap<TaskType, TaskConfig>,
    /// Consecutive failures before a model is skipped
    pub failure_threshold: u32,
    pub recovery_wait: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model: "llama3.2".to_string(),
            default_timeout: Duration::from_secs(60),
            default_retries: 1,
            default_max_tokens: 4096,
            fallback_model: None,
            tasks: HashMap::new(),
            failure_threshold: 3,
            recovery_wait: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct ModelHealth {
    failures: u32,
    unhealthy_since: Option<Instant>,
}

/// Model Router for task-based model selection
#[derive(Debug)]
pub struct ModelRouter {
    config: RouterConfig,
    health: HashMap<String, ModelHealth>,
}

impl ModelRouter {
    /// Load the override file if present, else the embedded defaults
    pub fn new() -> Result<Self> {
        let config = load_config(default_config_path().as_ref())?;
        Ok(Self {
            config,
            health: HashMap::new(),
        })
    }

    /// Create with an explicit configuration (for testing)
    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            config,
            health: HashMap::new(),
        }
    }

    /// Model for a task, skipping unhealthy ones
    pub fn model_for_task(&self, task: TaskType) -> &str {
        if let Some(task_config) = self.config.tasks.get(&task) {
            if self.is_healthy(&task_config.model) {
                return &task_config.model;
            }
        }

        if self.is_healthy(&self.config.default_model) {
            return &self.config.default_model;
        }

        if let Some(ref fallback) = self.config.fallback_model {
            if self.is_healthy(fallback) {
                return fallback;
            }
        }

        // Everything is unhealthy; let the call fail loudly
        &self.config.default_model
    }

    pub fn config_for_task(&self, task: TaskType) -> TaskConfig {
        self.config
            .tasks
            .get(&task)
            .cloned()
            .unwrap_or_else(|| TaskConfig {
                model: self.config.default_model.clone(),
                timeout: self.config.default_timeout,
                max_retries: self.config.default_retries,
                max_tokens: self.config.default_max_tokens,
            })
    }

    pub fn record_success(&mut self, model: &str) {
        let health = self.health.entry(model.to_string()).or_default();
        health.failures = 0;
        health.unhealthy_since = None;
    }

    /// Record a failed call, returns true if model is now unhealthy
    pub fn record_failure(&mut self, model: &str) -> bool {
        let threshold = self.config.failure_threshold;
        let health = self.health.entry(model.to_string()).or_default();
        health.failures += 1;
        if health.failures >= threshold && health.unhealthy_since.is_none() {
            health.unhealthy_since = Some(Instant::now());
        }
        health.failures >= threshold
    }

    pub fn is_healthy(&self, model: &str) -> bool {
        match self.health.get(model) {
            Some(health) if health.failures >= self.config.failure_threshold => health
                .unhealthy_since
                .is_some_and(|since| since.elapsed() >= self.config.recovery_wait),
            _ => true,
        }
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_config(RouterConfig::default()))
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("tesora").join("config").join("models.toml"))
}

fn load_config(override_path: Option<&PathBuf>) -> Result<RouterConfig> {
    match override_path {
        Some(path) if path.exists() => {
            let content = fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
            parse_config(&content)
        }
        _ => parse_config(DEFAULT_CONFIG),
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    defaults: Option<RawDefaults>,
    models: Option<HashMap<String, RawTaskConfig>>,
    health: Option<RawHealth>,
}

#[derive(Debug, Deserialize)]
struct RawDefaults {
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_tokens: Option<u32>,
    fallback_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTaskConfig {
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawHealth {
    failure_threshold: Option<u32>,
    recovery_wait_secs: Option<u64>,
}

fn parse_config(content: &str) -> Result<RouterConfig> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid model config TOML: {}", e)))?;

    let mut config = RouterConfig::default();

    if let Some(defaults) = raw.defaults {
        if let Some(model) = defaults.model {
            config.default_model = model;
        }
        if let Some(timeout) = defaults.timeout_secs {
            config.default_timeout = Duration::from_secs(timeout);
        }
        if let Some(retries) = defaults.max_retries {
            config.default_retries = retries;
        }
        if let Some(tokens) = defaults.max_tokens {
            config.default_max_tokens = tokens;
        }
        config.fallback_model = defaults.fallback_model;
    }

    if let Some(models) = raw.models {
        for (task_name, task_config) in models {
            let Ok(task) = task_name.parse::<TaskType>() else {
                tracing::warn!(task = %task_name, "Ignoring unknown task in model config");
                continue;
            };

            config.tasks.insert(
                task,
                TaskConfig {
                    model: task_config
                        .model
                        .unwrap_or_else(|| config.default_model.clone()),
                    timeout: task_config
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(config.default_timeout),
                    max_retries: task_config.max_retries.unwrap_or(config.default_retries),
                    max_tokens: task_config.max_tokens.unwrap_or(config.default_max_tokens),
                },
            );
        }
    }

    if let Some(health) = raw.health {
        if let Some(threshold) = health.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(wait) = health.recovery_wait_secs {
            config.recovery_wait = Duration::from_secs(wait);
        }
    }

    Ok(config)
}
