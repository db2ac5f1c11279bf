use futures::future::BoxFuture;
use serde_json::{json, Value};

use wayline_core::condition::Condition;
use wayline_core::config::ClassifierConfig;
use wayline_core::error::{Result, ToolInvocationError, WaylineError};
use wayline_core::traits::Tool;

/// Rule-table classifier for router nodes.
///
/// Rules are tried in order against the classifier input; the first match picks
/// the worker. Without a match the default worker is returned, or the call fails.
pub struct RuleClassifier {
    name: String,
    rules: Vec<(Condition, String)>,
    default: Option<String>,
}

impl RuleClassifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: vec![],
            default: None,
        }
    }

    pub fn rule(mut self, condition: Condition, worker: impl Into<String>) -> Self {
        self.rules.push((condition, worker.into()));
        self
    }

    pub fn default_worker(mut self, worker: impl Into<String>) -> Self {
        self.default = Some(worker.into());
        self
    }

    /// Build from a `[[classifiers]]` table, parsing every rule condition up front.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let mut classifier = Self::new(&config.name);
        for rule in &config.rules {
            let condition: Condition = rule.when.parse().map_err(|e| {
                WaylineError::Config(format!(
                    "classifier '{}': rule '{}': {}",
                    config.name, rule.when, e
                ))
            })?;
            classifier = classifier.rule(condition, &rule.worker);
        }
        classifier.default = config.default.clone();
        Ok(classifier)
    }

    /// Pick a worker for `input`.
    pub fn classify(&self, input: &Value) -> Option<&str> {
        self.rules
            .iter()
            .find(|(condition, _)| condition.evaluate_value(input))
            .map(|(_, worker)| worker.as_str())
            .or(self.default.as_deref())
    }
}

impl Tool for RuleClassifier {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Choose a worker from an ordered rule table."
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"worker": {"type": "string"}},
            "required": ["worker"]
        })
    }
    fn invoke(&self, input: Value) -> BoxFuture<'_, std::result::Result<Value, ToolInvocationError>> {
        Box::pin(async move {
            match self.classify(&input) {
                Some(worker) => {
                    tracing::debug!(classifier = %self.name, worker, "Classified input");
                    Ok(json!({ "worker": worker }))
                }
                None => Err(ToolInvocationError::failed(
                    &self.name,
                    "no rule matched and no default worker is configured",
                )),
            }
        })
    }
}
