//! Runtime settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Durations are stored as integer milliseconds/seconds and exposed through
//! accessor methods returning [`Duration`].

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::queue::{Priority, ResourceClass};

// ---------------------------------------------------------------------------
// ClassConfig
// ---------------------------------------------------------------------------

/// Admission and execution policy for one resource class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Maximum number of tasks of this class executing at once.
    pub concurrency: usize,
    /// Maximum number of tasks waiting in this class's queue.
    pub queue_capacity: usize,
    /// Per-attempt deadline in milliseconds.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub retry_max_delay_ms: u64,
    /// Priority applied when the caller does not pick one.
    pub default_priority: Priority,
}

impl ClassConfig {
    fn with_limits(concurrency: usize, queue_capacity: usize, timeout_secs: u64) -> Self {
        Self {
            concurrency,
            queue_capacity,
            timeout_ms: timeout_secs * 1_000,
            max_retries: 2,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4_000,
            default_priority: Priority::Normal,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Settings for the priority admission queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How often the scheduler scans the class queues.
    pub scheduler_interval_ms: u64,
    /// Average load percentage above which the system reports high load.
    pub high_load_threshold: f64,
    pub recognition: ClassConfig,
    pub synthesis: ClassConfig,
    pub generation: ClassConfig,
    pub health_check: ClassConfig,
}

impl QueueConfig {
    /// Policy for `class`.
    pub fn class(&self, class: ResourceClass) -> &ClassConfig {
        match class {
            ResourceClass::Recognition => &self.recognition,
            ResourceClass::Synthesis => &self.synthesis,
            ResourceClass::Generation => &self.generation,
            ResourceClass::HealthCheck => &self.health_check,
        }
    }

    /// Mutable policy for `class` (used by tests and tuning tools).
    pub fn class_mut(&mut self, class: ResourceClass) -> &mut ClassConfig {
        match class {
            ResourceClass::Recognition => &mut self.recognition,
            ResourceClass::Synthesis => &mut self.synthesis,
            ResourceClass::Generation => &mut self.generation,
            ResourceClass::HealthCheck => &mut self.health_check,
        }
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms.max(1))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut health_check = ClassConfig::with_limits(20, 40, 8);
        health_check.default_priority = Priority::Low;
        health_check.max_retries = 0;

        let mut generation = ClassConfig::with_limits(35, 100, 45);
        generation.max_retries = 1;

        Self {
            scheduler_interval_ms: 10,
            high_load_threshold: 80.0,
            recognition: ClassConfig::with_limits(25, 150, 20),
            synthesis: ClassConfig::with_limits(30, 200, 15),
            generation,
            health_check,
        }
    }
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// Settings for the connection pool executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on reusable slots per remote host.
    pub max_connections_per_host: usize,
    /// Hard ceiling on in-flight requests across all hosts.
    pub global_concurrency: usize,
    /// Slots idle longer than this are closed by the reaper.
    pub keep_alive_secs: u64,
    /// How often the reaper runs.
    pub reap_interval_secs: u64,
    /// Default per-request deadline.
    pub request_timeout_ms: u64,
    /// Default retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 16,
            global_concurrency: 100,
            keep_alive_secs: 60,
            reap_interval_secs: 30,
            request_timeout_ms: 30_000,
            max_retries: 2,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Settings for the bounded response cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry ceiling per sub-cache.
    pub max_entries: usize,
    /// Global memory budget in bytes shared by the text and audio caches.
    pub max_memory_bytes: usize,
    /// Fraction of `max_memory_bytes` reserved for text responses (0.0 – 1.0).
    pub text_memory_share: f64,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Byte budget of the text sub-cache.
    pub fn text_budget(&self) -> usize {
        let share = self.text_memory_share.clamp(0.0, 1.0);
        (self.max_memory_bytes as f64 * share) as usize
    }

    /// Byte budget of the audio sub-cache.
    pub fn audio_budget(&self) -> usize {
        self.max_memory_bytes.saturating_sub(self.text_budget())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_memory_bytes: 64 * 1024 * 1024,
            text_memory_share: 0.1,
            ttl_secs: 30 * 60,
            cleanup_interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

/// Connection details for the three backend services.
///
/// Every URL is a base URL; the adapters append OpenAI-compatible paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub recognition_url: String,
    pub generation_url: String,
    pub synthesis_url: String,
    /// Bearer token — `None` for local services.
    pub api_key: Option<String>,
    pub recognition_model: String,
    pub generation_model: String,
    pub synthesis_model: String,
    /// Voice selector passed to the synthesis service.
    pub voice: String,
    /// Sampling temperature for generation.
    pub temperature: f32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            recognition_url: "http://localhost:8000".into(),
            generation_url: "http://localhost:11434".into(),
            synthesis_url: "http://localhost:8880".into(),
            api_key: None,
            recognition_model: "whisper-1".into(),
            generation_model: "qwen2.5:3b".into(),
            synthesis_model: "tts-1".into(),
            voice: "alloy".into(),
            temperature: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Settings for the conversation pipeline orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// System prompt placed at the head of every generation request.
    pub system_prompt: String,
    /// Sentences shorter than this are merged into the following one.
    pub min_sentence_chars: usize,
    /// Messages kept in the rolling conversation window.
    pub history_window: usize,
    /// Messages sent on the trimmed-context retry after an empty reply.
    pub trimmed_context_messages: usize,
    /// Messages folded into the generation cache fingerprint.
    pub fingerprint_messages: usize,
    /// Hard upper bound for one turn.
    pub turn_timeout_secs: u64,
    /// Stream generation output (`false` = one buffered response).
    pub stream_generation: bool,
}

impl PipelineConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a friendly voice assistant. Answer in short, \
                            spoken sentences without lists or markup."
                .into(),
            min_sentence_chars: 2,
            history_window: 20,
            trimmed_context_messages: 2,
            fingerprint_messages: 4,
            turn_timeout_secs: 120,
            stream_generation: true,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_relay::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub backends: BackendConfig,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
