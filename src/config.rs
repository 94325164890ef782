use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::collector::{Assignment, CollectorSettings};
use crate::multiline::{MatchMode, MultilineConfig, ReplacePolicy};
use crate::queue::OverflowPolicy;

/// Main configuration for logship, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipperConfig {
    #[serde(default)]
    pub collector: CollectorSection,
    pub sources: Vec<SourceSection>,
    pub targets: Vec<TargetSection>,
}

/// Thread pool, queue and shutdown tuning. All durations are humantime
/// strings ("250ms", "5s", "1m").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSection {
    /// Input (reader) threads; 0 means one per CPU, capped by source count.
    pub input_threads: usize,
    /// Output (dispatch) threads; 0 means one per target.
    pub output_threads: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowKind,
    /// Bounded wait for a full queue under the block policy.
    pub push_timeout: String,
    pub poll_interval: String,
    pub shutdown_grace: String,
    pub max_record_len: usize,
    /// Records consumed from one source per pass before moving on.
    pub records_per_pass: usize,
    pub assignment: AssignmentKind,
    pub dispatch_retries: usize,
    pub retry_backoff: String,
    /// Checkpoint status file; omit to disable persistence.
    pub status_file: Option<PathBuf>,
    pub status_interval: String,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            input_threads: 0,
            output_threads: 0,
            queue_capacity: 128,
            overflow: OverflowKind::Block,
            push_timeout: "1s".to_string(),
            poll_interval: "500ms".to_string(),
            shutdown_grace: "5s".to_string(),
            max_record_len: 65536,
            records_per_pass: 1000,
            assignment: AssignmentKind::RoundRobin,
            dispatch_retries: 3,
            retry_backoff: "100ms".to_string(),
            status_file: None,
            status_interval: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowKind {
    Block,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    RoundRobin,
    Dedicated,
}

/// One monitored file and its boundary rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    pub path: PathBuf,
    pub targets: Vec<String>,
    pub multiline: MultilineSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultilineSection {
    pub mode: MatchModeKind,
    pub pattern: String,
    #[serde(default)]
    pub replace: ReplaceKind,
    #[serde(default = "default_multiline_timeout")]
    pub timeout: String,
}

fn default_multiline_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchModeKind {
    Start,
    End,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceKind {
    Drop,
    Space,
    Tab,
    #[default]
    Keep,
}

/// One dispatch destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSection {
    Stdout { name: String },
    File { name: String, path: PathBuf },
    Null { name: String },
}

impl TargetSection {
    pub fn name(&self) -> &str {
        match self {
            TargetSection::Stdout { name } => name,
            TargetSection::File { name, .. } => name,
            TargetSection::Null { name } => name,
        }
    }
}

impl ShipperConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file: {}", path.display()))?;
        let config: ShipperConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("no sources configured");
        }
        if self.targets.is_empty() {
            bail!("no targets configured");
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name().is_empty() {
                bail!("target with empty name");
            }
            if !names.insert(target.name()) {
                bail!("duplicate target name: {}", target.name());
            }
        }

        let mut paths = HashSet::new();
        for source in &self.sources {
            if !paths.insert(&source.path) {
                bail!("duplicate source path: {}", source.path.display());
            }
            if source.targets.is_empty() {
                bail!("source {} has no targets", source.path.display());
            }
            for target in &source.targets {
                if !names.contains(target.as_str()) {
                    bail!(
                        "source {} references unknown target: {}",
                        source.path.display(),
                        target
                    );
                }
            }
            // Surface bad patterns at load time, not in a reader thread.
            source.multiline.compile()?;
        }

        if self.collector.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.collector.max_record_len < 2 {
            bail!("max_record_len must be at least 2");
        }
        if self.collector.records_per_pass == 0 {
            bail!("records_per_pass must be at least 1");
        }
        self.collector_settings()?;
        self.overflow_policy()?;
        parse_duration(&self.collector.status_interval, "status_interval")?;
        Ok(())
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn overflow_policy(&self) -> Result<OverflowPolicy> {
        Ok(match self.collector.overflow {
            OverflowKind::Block => {
                OverflowPolicy::Block(parse_duration(&self.collector.push_timeout, "push_timeout")?)
            }
            OverflowKind::Drop => OverflowPolicy::Drop,
        })
    }

    pub fn collector_settings(&self) -> Result<CollectorSettings> {
        let input_threads = if self.collector.input_threads == 0 {
            num_cpus::get().min(self.sources.len().max(1))
        } else {
            self.collector.input_threads
        };
        let output_threads = if self.collector.output_threads == 0 {
            self.targets.len().max(1)
        } else {
            self.collector.output_threads
        };
        Ok(CollectorSettings {
            input_threads,
            output_threads,
            max_record_len: self.collector.max_record_len,
            records_per_pass: self.collector.records_per_pass,
            poll_interval: parse_duration(&self.collector.poll_interval, "poll_interval")?,
            shutdown_grace: parse_duration(&self.collector.shutdown_grace, "shutdown_grace")?,
            assignment: match self.collector.assignment {
                AssignmentKind::RoundRobin => Assignment::RoundRobin,
                AssignmentKind::Dedicated => Assignment::Dedicated,
            },
            retry_limit: self.collector.dispatch_retries,
            retry_backoff: parse_duration(&self.collector.retry_backoff, "retry_backoff")?,
        })
    }

    pub fn status_interval(&self) -> Result<Duration> {
        parse_duration(&self.collector.status_interval, "status_interval")
    }
}

impl MultilineSection {
    /// Compile into the runtime configuration used by the reassembler.
    pub fn compile(&self) -> Result<MultilineConfig> {
        let mode = match self.mode {
            MatchModeKind::Start => MatchMode::Start,
            MatchModeKind::End => MatchMode::End,
            MatchModeKind::All => MatchMode::All,
        };
        let replace = match self.replace {
            ReplaceKind::Drop => ReplacePolicy::Drop,
            ReplaceKind::Space => ReplacePolicy::Space,
            ReplaceKind::Tab => ReplacePolicy::Tab,
            ReplaceKind::Keep => ReplacePolicy::Keep,
        };
        let timeout = parse_duration(&self.timeout, "multiline timeout")?;
        MultilineConfig::new(mode, &self.pattern, replace, timeout)
    }
}

fn parse_duration(value: &str, field: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {}: {:?}", field, value))
}
