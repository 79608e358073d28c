//! Pre-dispatch policy gate.
//!
//! Every rule runs against every request; a single failing rule blocks it.
//! Rules never mutate the request. Sanitization, if any, happens downstream.

use crate::dispatch::GenerateRequest;

/// Default prompt length cap, in chars.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 32 * 1024;

/// Default ceiling for `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u64 = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub passed: bool,
    pub reason: Option<String>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait PolicyRule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome;
}

/// Closures are rules. The name is the closure's type name, so prefer a
/// struct when the name shows up in logs.
impl<F> PolicyRule for F
where
    F: Fn(&GenerateRequest) -> RuleOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        std::any::type_name::<F>()
    }

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome {
        self(request)
    }
}

pub struct NonEmptyPrompt;

impl PolicyRule for NonEmptyPrompt {
    fn name(&self) -> &str {
        "non_empty_prompt"
    }

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome {
        if request.prompt.trim().is_empty() {
            return RuleOutcome::fail("prompt must not be empty");
        }
        RuleOutcome::pass()
    }
}

pub struct MaxPromptChars(pub usize);

impl PolicyRule for MaxPromptChars {
    fn name(&self) -> &str {
        "max_prompt_chars"
    }

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome {
        let len = request.prompt.chars().count()
            + request
                .system_prompt
                .as_deref()
                .map_or(0, |s| s.chars().count());
        if len > self.0 {
            return RuleOutcome::fail(format!(
                "prompt is {len} chars, limit is {}",
                self.0
            ));
        }
        RuleOutcome::pass()
    }
}

/// Case-insensitive substring blocklist over prompt and system prompt.
pub struct Blocklist {
    terms: Vec<String>,
}

impl Blocklist {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl PolicyRule for Blocklist {
    fn name(&self) -> &str {
        "blocklist"
    }

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome {
        let mut haystack = request.prompt.to_lowercase();
        if let Some(ref system) = request.system_prompt {
            haystack.push('\n');
            haystack.push_str(&system.to_lowercase());
        }
        let hits: Vec<&str> = self
            .terms
            .iter()
            .filter(|t| haystack.contains(t.as_str()))
            .map(String::as_str)
            .collect();
        if hits.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(format!("prompt contains blocked terms: {}", hits.join(", ")))
        }
    }
}

pub struct TemperatureRange;

impl PolicyRule for TemperatureRange {
    fn name(&self) -> &str {
        "temperature_range"
    }

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome {
        if let Some(t) = request.temperature
            && (!t.is_finite() || !(0.0..=2.0).contains(&t))
        {
            return RuleOutcome::fail(format!("temperature must be between 0.0 and 2.0, got {t}"));
        }
        RuleOutcome::pass()
    }
}

pub struct MaxTokensLimit(pub u64);

impl PolicyRule for MaxTokensLimit {
    fn name(&self) -> &str {
        "max_tokens_limit"
    }

    fn evaluate(&self, request: &GenerateRequest) -> RuleOutcome {
        match request.max_tokens {
            Some(0) => RuleOutcome::fail("max_tokens must be at least 1"),
            Some(n) if n > self.0 => {
                RuleOutcome::fail(format!("max_tokens {n} exceeds limit {}", self.0))
            }
            _ => RuleOutcome::pass(),
        }
    }
}

/// Outcome of running every rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub violations: Vec<String>,
}

impl PolicyVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Default)]
pub struct PolicyFilter {
    rules: Vec<Box<dyn PolicyRule>>,
}

impl PolicyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard rule set: non-empty prompt, length cap, temperature range,
    /// max_tokens ceiling, and the blocklist when it has terms.
    pub fn standard(config: &crate::config::PolicyConfig) -> Self {
        let mut filter = Self::new()
            .with_rule(NonEmptyPrompt)
            .with_rule(MaxPromptChars(config.max_prompt_chars))
            .with_rule(TemperatureRange)
            .with_rule(MaxTokensLimit(config.max_tokens));
        let blocklist = Blocklist::new(&config.blocklist);
        if !blocklist.is_empty() {
            filter = filter.with_rule(blocklist);
        }
        filter
    }

    pub fn with_rule(mut self, rule: impl PolicyRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run all rules, collecting every violation.
    pub fn evaluate(&self, request: &GenerateRequest) -> PolicyVerdict {
        let violations = self
            .rules
            .iter()
            .filter_map(|rule| {
                let outcome = rule.evaluate(request);
                if outcome.passed {
                    None
                } else {
                    Some(
                        outcome
                            .reason
                            .unwrap_or_else(|| format!("rejected by {}", rule.name())),
                    )
                }
            })
            .collect();
        PolicyVerdict { violations }
    }
}

impl std::fmt::Debug for PolicyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        f.debug_struct("PolicyFilter").field("rules", &names).finish()
    }
}
