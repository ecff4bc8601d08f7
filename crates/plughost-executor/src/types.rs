//! Value types crossing the executor boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Caller-supplied context passed through to every plugin call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub device_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl ExecutionContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_device_info(mut self, device_info: Value) -> Self {
        self.device_info = device_info;
        self
    }

    pub fn with_mobile_context(mut self, mobile_context: Value) -> Self {
        self.mobile_context = Some(mobile_context);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// The context as sent on the wire, tagged with the call's target.
    pub(crate) fn to_wire(&self, plugin_id: &str, procedure_id: &str) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut value {
            map.insert("plugin_id".into(), Value::String(plugin_id.to_owned()));
            map.insert(
                "procedure_id".into(),
                Value::String(procedure_id.to_owned()),
            );
        }
        value
    }
}

/// Timing and identity of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    pub duration_ms: u64,
    pub plugin_id: String,
    pub procedure_id: String,
}

/// Outcome of `execute`, `execute_chain` or `test`.
///
/// `error` is `Some` exactly when `success` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub performance_metrics: CallMetrics,
}

impl ExecutionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata: Map::new(),
            performance_metrics: CallMetrics::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            metadata: Map::new(),
            performance_metrics: CallMetrics::default(),
        }
    }

    /// Interpret a plugin's `process` reply.
    ///
    /// An object carrying a boolean `success` is taken as a structured
    /// result; anything else is raw data from a successful call.
    pub fn from_reply(reply: Value) -> Self {
        let Value::Object(mut map) = reply else {
            return Self::ok(reply);
        };
        let Some(success) = map.get("success").and_then(Value::as_bool) else {
            return Self::ok(Value::Object(map));
        };

        let data = map.remove("data").unwrap_or(Value::Null);
        let metadata = match map.remove("metadata") {
            Some(Value::Object(meta)) => meta,
            _ => Map::new(),
        };
        let error = map.remove("error").map(|e| match e {
            Value::String(s) => s,
            other => other.to_string(),
        });

        let mut result = if success {
            Self::ok(data)
        } else {
            let mut failed =
                Self::failure(error.unwrap_or_else(|| "plugin reported failure".to_owned()));
            failed.data = data;
            failed
        };
        result.metadata = metadata;
        result
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn with_metrics(
        mut self,
        plugin_id: &str,
        procedure_id: &str,
        duration_ms: u64,
    ) -> Self {
        self.performance_metrics = CallMetrics {
            duration_ms,
            plugin_id: plugin_id.to_owned(),
            procedure_id: procedure_id.to_owned(),
        };
        self
    }
}

/// One step of an execution chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub plugin_id: String,
    pub procedure_id: String,
    /// Merged over the carried payload when both are objects.
    #[serde(default)]
    pub params: Value,
}

impl ChainStep {
    pub fn new(plugin_id: impl Into<String>, procedure_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            procedure_id: procedure_id.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// The input for this step given the previous step's output.
    pub(crate) fn input_for(&self, payload: Value) -> Value {
        match (payload, &self.params) {
            (Value::Object(mut carried), Value::Object(params)) => {
                for (key, value) in params {
                    carried.insert(key.clone(), value.clone());
                }
                Value::Object(carried)
            }
            (Value::Null, Value::Object(params)) => Value::Object(params.clone()),
            (payload, _) => payload,
        }
    }
}
