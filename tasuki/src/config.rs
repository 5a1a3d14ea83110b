//! Runtime configuration.
//!
//! A [`Config`] bundles the LLM provider pools, the caller's callback, and
//! the knobs shared by every task the runtime executes. Construction goes
//! through [`ConfigBuilder`], which validates that a `default` provider pool
//! exists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::Agent;
use crate::callback::{NoopCallback, TaskCallback};
use crate::error::TaskError;
use crate::llm::LlmProvider;

/// The key every configuration must map to a provider pool.
pub const DEFAULT_LLM_KEY: &str = "default";

/// Retry behavior for the LLM adapter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per request (first try included).
    pub max_attempts: usize,
    /// Base delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound for the backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for a given retry (0-based), with jitter.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1_u64 << retry.min(16));
        let capped = exp.min(self.max_delay_ms);
        // Up to 25% jitter keeps concurrent retries from synchronizing.
        let jitter = (capped / 4).max(1);
        Duration::from_millis(capped + fastrand::u64(0..jitter))
    }
}

/// What the scheduler does when an agent in a level fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum FailurePolicy {
    /// Stop dispatching further agents after the first failure.
    #[default]
    FailFast,
    /// Keep executing agents whose dependencies succeeded.
    BestEffort,
    /// Re-run a failed agent up to the given number of extra attempts
    /// before giving up on it (then stop like `FailFast`).
    Retry(u32),
}

/// Runtime configuration shared by all tasks.
#[derive(Clone)]
pub struct Config {
    /// Provider pools keyed by name; `default` is mandatory.
    pub llms: HashMap<String, Vec<Arc<dyn LlmProvider>>>,
    /// Ordered pool keys used for planning, replanning and judging.
    pub plan_llms: Vec<String>,
    /// Agents registered for planning and execution.
    pub agents: Vec<Arc<Agent>>,
    /// Streaming and human-in-the-loop hooks.
    pub callback: Arc<dyn TaskCallback>,
    /// Turn cap for each agent's ReAct loop.
    pub max_react_turns: usize,
    /// Output token cap forwarded to agent LLM calls.
    pub max_tokens: Option<u32>,
    /// Default sampling temperature for agent turns.
    pub default_temperature: f32,
    /// Concurrency cap within a scheduling level; `None` means level size.
    pub max_concurrent_agents: Option<usize>,
    /// Per-task failure policy.
    pub failure_policy: FailurePolicy,
    /// Retry policy for the LLM adapter.
    pub retry: RetryPolicy,
    /// Compose the final result with an extra LLM summary call.
    pub compose_final: bool,
    /// Run the progress/loop-detection meta call every N turns.
    pub progress_check_interval: Option<usize>,
    /// Timeout for internal helper LLM calls (judging, composing).
    pub meta_llm_timeout: Duration,
}

impl Config {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// The provider pool for a key, if configured.
    #[must_use]
    pub fn pool(&self, key: &str) -> Option<&[Arc<dyn LlmProvider>]> {
        self.llms.get(key).map(Vec::as_slice)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("llm_keys", &self.llms.keys().collect::<Vec<_>>())
            .field("plan_llms", &self.plan_llms)
            .field("max_react_turns", &self.max_react_turns)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    llms: HashMap<String, Vec<Arc<dyn LlmProvider>>>,
    plan_llms: Option<Vec<String>>,
    agents: Vec<Arc<Agent>>,
    callback: Arc<dyn TaskCallback>,
    max_react_turns: usize,
    max_tokens: Option<u32>,
    default_temperature: f32,
    max_concurrent_agents: Option<usize>,
    failure_policy: FailurePolicy,
    retry: RetryPolicy,
    compose_final: bool,
    progress_check_interval: Option<usize>,
    meta_llm_timeout: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            llms: HashMap::new(),
            plan_llms: None,
            agents: Vec::new(),
            callback: Arc::new(NoopCallback),
            max_react_turns: 30,
            max_tokens: None,
            default_temperature: 0.7,
            max_concurrent_agents: None,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            compose_final: false,
            progress_check_interval: None,
            meta_llm_timeout: Duration::from_secs(60),
        }
    }

    /// Register a single provider under a key.
    #[must_use]
    pub fn llm(mut self, key: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.llms.entry(key.into()).or_default().push(provider);
        self
    }

    /// Register an ordered provider pool under a key.
    #[must_use]
    pub fn llm_pool(
        mut self,
        key: impl Into<String>,
        providers: Vec<Arc<dyn LlmProvider>>,
    ) -> Self {
        self.llms.insert(key.into(), providers);
        self
    }

    /// Ordered pool keys used for planning, replanning and judging.
    #[must_use]
    pub fn plan_llms(mut self, keys: Vec<String>) -> Self {
        self.plan_llms = Some(keys);
        self
    }

    /// Register an agent for planning and execution.
    #[must_use]
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(Arc::new(agent));
        self
    }

    /// Register several agents.
    #[must_use]
    pub fn agents(mut self, agents: impl IntoIterator<Item = Agent>) -> Self {
        self.agents.extend(agents.into_iter().map(Arc::new));
        self
    }

    /// Set the streaming callback.
    #[must_use]
    pub fn callback(mut self, callback: Arc<dyn TaskCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Set the ReAct turn cap (default 30).
    #[must_use]
    pub const fn max_react_turns(mut self, turns: usize) -> Self {
        self.max_react_turns = turns;
        self
    }

    /// Cap output tokens on agent LLM calls.
    #[must_use]
    pub const fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Default sampling temperature for agent turns (default 0.7).
    #[must_use]
    pub const fn default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = temperature;
        self
    }

    /// Cap how many agents run concurrently within a scheduling level.
    #[must_use]
    pub const fn max_concurrent_agents(mut self, max: usize) -> Self {
        self.max_concurrent_agents = Some(max);
        self
    }

    /// Set the per-task failure policy.
    #[must_use]
    pub const fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the adapter retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Compose the final result with an extra LLM summary call.
    #[must_use]
    pub const fn compose_final(mut self, compose: bool) -> Self {
        self.compose_final = compose;
        self
    }

    /// Run the progress/loop-detection meta call every N turns.
    #[must_use]
    pub const fn progress_check_interval(mut self, turns: usize) -> Self {
        self.progress_check_interval = Some(turns);
        self
    }

    /// Timeout for internal helper LLM calls (default 60 s).
    #[must_use]
    pub const fn meta_llm_timeout(mut self, timeout: Duration) -> Self {
        self.meta_llm_timeout = timeout;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when no `default` provider pool is
    /// registered, or when a plan key references a missing pool.
    pub fn build(self) -> Result<Config, TaskError> {
        if !self.llms.contains_key(DEFAULT_LLM_KEY) {
            return Err(TaskError::config("missing 'default' llm provider"));
        }
        let plan_llms = self
            .plan_llms
            .unwrap_or_else(|| vec![DEFAULT_LLM_KEY.to_owned()]);
        for key in &plan_llms {
            if !self.llms.contains_key(key) {
                return Err(TaskError::config(format!(
                    "plan llm key '{key}' has no provider pool"
                )));
            }
        }
        Ok(Config {
            llms: self.llms,
            plan_llms,
            agents: self.agents,
            callback: self.callback,
            max_react_turns: self.max_react_turns,
            max_tokens: self.max_tokens,
            default_temperature: self.default_temperature,
            max_concurrent_agents: self.max_concurrent_agents,
            failure_policy: self.failure_policy,
            retry: self.retry,
            compose_final: self.compose_final,
            progress_check_interval: self.progress_check_interval,
            meta_llm_timeout: self.meta_llm_timeout,
        })
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("llm_keys", &self.llms.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
