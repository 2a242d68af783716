//! The capability map: a read-only registry of expert profiles built from
//! declarative configuration at startup. No locks on the hot path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mnemo_provider::ModelConfig;

use crate::error::{Result, RoutingError};

/// Which execution loop an expert runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStrategy {
    /// Plan → parallel retrieval → streamed synthesis.
    #[default]
    TwoPhase,
    /// Think → tool → observe loop.
    React,
}

/// Scoring weights for the rule layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightConfig {
    #[serde(default)]
    pub base_score: f64,
    #[serde(default = "default_keyword_bonus")]
    pub keyword_bonus: f64,
    #[serde(default = "default_timeword_bonus")]
    pub timeword_bonus: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            base_score: 0.0,
            keyword_bonus: default_keyword_bonus(),
            timeword_bonus: default_timeword_bonus(),
        }
    }
}

fn default_keyword_bonus() -> f64 {
    2.0
}
fn default_timeword_bonus() -> f64 {
    1.0
}

/// Optional short-circuit: time-pattern + query-word with no competing
/// keyword routes straight to this expert at confidence 0.85.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPath {
    pub query_words: Vec<String>,
}

/// Routing section of an expert's declarative config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingRules {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub weight_config: WeightConfig,
    /// Mutually-exclusive category labels; within a group only the highest
    /// scorer keeps its score.
    #[serde(default)]
    pub mutex_groups: Vec<String>,
    #[serde(default)]
    pub fast_path: Option<FastPath>,
}

/// Declarative per-expert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertConfig {
    pub name: String,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub strategy: ExpertStrategy,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub routing: RoutingRules,
    #[serde(default)]
    pub model_config: ModelConfig,
}

/// Registry mapping expert names to profiles, with a tokenized keyword
/// index. Built once at startup, read-only after.
pub struct CapabilityMap {
    experts: Vec<ExpertConfig>,
    by_name: HashMap<String, usize>,
    keyword_index: HashMap<String, Vec<usize>>,
}

impl CapabilityMap {
    pub fn new() -> Self {
        Self {
            experts: Vec::new(),
            by_name: HashMap::new(),
            keyword_index: HashMap::new(),
        }
    }

    pub fn from_configs(configs: Vec<ExpertConfig>) -> Result<Self> {
        let mut map = Self::new();
        for config in configs {
            map.register(config)?;
        }
        Ok(map)
    }

    /// Register an expert. Duplicate names are rejected.
    pub fn register(&mut self, config: ExpertConfig) -> Result<()> {
        if self.by_name.contains_key(&config.name) {
            return Err(RoutingError::DuplicateExpert { name: config.name });
        }
        let idx = self.experts.len();
        for keyword in &config.routing.keywords {
            self.keyword_index
                .entry(keyword.to_lowercase())
                .or_default()
                .push(idx);
        }
        self.by_name.insert(config.name.clone(), idx);
        self.experts.push(config);
        Ok(())
    }

    pub fn get_expert(&self, name: &str) -> Option<&ExpertConfig> {
        self.by_name.get(name).map(|&i| &self.experts[i])
    }

    pub fn experts(&self) -> impl Iterator<Item = &ExpertConfig> {
        self.experts.iter()
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    /// Experts declaring a capability (case-insensitive substring match).
    pub fn find_by_capability(&self, capability: &str) -> Vec<&ExpertConfig> {
        let needle = capability.to_lowercase();
        self.experts
            .iter()
            .filter(|e| {
                e.capabilities
                    .iter()
                    .any(|c| c.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Experts registered under an exact keyword token.
    pub fn find_by_keyword(&self, token: &str) -> Vec<&ExpertConfig> {
        self.keyword_index
            .get(&token.to_lowercase())
            .map(|idxs| idxs.iter().map(|&i| &self.experts[i]).collect())
            .unwrap_or_default()
    }

    /// Find alternatives for a handoff: experts whose capabilities or
    /// description textually match the requested ability, excluding the
    /// expert that reported inability. Empty when none match.
    pub fn find_for_handoff(&self, ability: &str, exclude: &str) -> Vec<&ExpertConfig> {
        let tokens: Vec<String> = ability
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &ExpertConfig)> = self
            .experts
            .iter()
            .filter(|e| e.name != exclude)
            .filter_map(|e| {
                let haystack = format!(
                    "{} {} {}",
                    e.capabilities.join(" "),
                    e.description,
                    e.routing.keywords.join(" ")
                )
                .to_lowercase();
                let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
                if hits > 0 {
                    Some((hits, e))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.name.cmp(&b.1.name)));
        scored.into_iter().map(|(_, e)| e).collect()
    }
}

impl Default for CapabilityMap {
    fn default() -> Self {
        Self::new()
    }
}
