//! Demo plugin speaking the PlugHost wire protocol.
//!
//! Procedures:
//! - `echo.run`: structured echo of the input
//! - `echo.upper`: `input.text` uppercased, as a raw value
//! - `echo.fail`: plugin-reported error with `input.message`
//! - `echo.sleep`: blocks for `input.ms` milliseconds
//! - `echo.crash`: exits without answering
//!
//! `ECHO_PLUGIN_METHODS` (comma-separated) replaces the advertised method
//! list; `ECHO_PLUGIN_FAIL_INIT` makes `initialize` fail.

use std::time::Duration;

use plughost_executor::guest::{self, Plugin};
use serde_json::{Value, json};

#[derive(Default)]
struct Echo {
    plugin_id: String,
    calls: u64,
}

impl Plugin for Echo {
    fn methods(&self) -> Vec<String> {
        match std::env::var("ECHO_PLUGIN_METHODS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_owned)
                .collect(),
            Err(_) => guest::default_methods(),
        }
    }

    fn initialize(&mut self, plugin_id: &str, _config: &Value) -> Result<(), String> {
        if std::env::var_os("ECHO_PLUGIN_FAIL_INIT").is_some() {
            return Err("initialization refused".into());
        }
        self.plugin_id = plugin_id.to_owned();
        eprintln!("echo-plugin: initialized as `{plugin_id}`");
        Ok(())
    }

    fn process(&mut self, procedure: &str, input: Value, _context: &Value) -> Result<Value, String> {
        self.calls += 1;
        match procedure {
            "echo.run" => Ok(json!({
                "success": true,
                "data": input,
                "metadata": {
                    "plugin_id": self.plugin_id,
                    "calls": self.calls,
                    "pid": std::process::id(),
                },
            })),
            "echo.upper" => {
                let text = input["text"]
                    .as_str()
                    .ok_or("input.text must be a string")?;
                Ok(Value::String(text.to_uppercase()))
            }
            "echo.fail" => Err(input["message"]
                .as_str()
                .unwrap_or("requested failure")
                .to_owned()),
            "echo.sleep" => {
                let ms = input["ms"].as_u64().unwrap_or(1_000);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "slept_ms": ms }))
            }
            "echo.crash" => std::process::exit(3),
            other => Err(format!("unknown procedure `{other}`")),
        }
    }

    fn cleanup(&mut self) {
        eprintln!("echo-plugin: served {} calls", self.calls);
    }
}

fn main() -> std::io::Result<()> {
    guest::serve(&mut Echo::default())
}
