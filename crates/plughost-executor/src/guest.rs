//! Plugin-side half of the wire protocol, for plugins written in Rust.
//!
//! Implement [`Plugin`] and hand it to [`serve`]:
//!
//! ```no_run
//! use plughost_executor::guest::{self, Plugin};
//! use serde_json::Value;
//!
//! struct Upper;
//!
//! impl Plugin for Upper {
//!     fn process(&mut self, _procedure: &str, input: Value, _ctx: &Value) -> Result<Value, String> {
//!         let text = input["text"].as_str().ok_or("input.text must be a string")?;
//!         Ok(Value::String(text.to_uppercase()))
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     guest::serve(&mut Upper)
//! }
//! ```
//!
//! The loop is synchronous: one request in, one response out.  Anything
//! the plugin wants to log belongs on stderr.

use std::io::{self, BufRead, Write};

use serde_json::{Value, json};

use crate::protocol::{self, CLEANUP, INITIALIZE, PROCESS, Request, Response};

/// Methods advertised when a plugin does not override [`Plugin::methods`].
pub fn default_methods() -> Vec<String> {
    vec![PROCESS.to_owned(), CLEANUP.to_owned()]
}

pub trait Plugin {
    /// Methods reported from `initialize`.  Any name other than `process`
    /// and `cleanup` is dispatched to [`process`](Self::process) with the
    /// method name as the procedure.
    fn methods(&self) -> Vec<String> {
        default_methods()
    }

    fn initialize(&mut self, _plugin_id: &str, _config: &Value) -> Result<(), String> {
        Ok(())
    }

    fn process(&mut self, procedure: &str, input: Value, context: &Value)
    -> Result<Value, String>;

    fn cleanup(&mut self) {}
}

/// Serve requests from stdin until it closes.
pub fn serve<P: Plugin>(plugin: &mut P) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_io(plugin, stdin.lock(), stdout.lock())
}

/// Serve requests from `reader`, writing responses to `writer`.
pub fn serve_io<P, R, W>(plugin: &mut P, reader: R, mut writer: W) -> io::Result<()>
where
    P: Plugin,
    R: BufRead,
    W: Write,
{
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // Without an id there is nobody to answer.
        let Ok(request) = serde_json::from_str::<Request>(&line) else {
            continue;
        };

        let response = handle(plugin, request);
        writer.write_all(protocol::encode(&response)?.as_bytes())?;
        writer.flush()?;
    }
    Ok(())
}

fn handle<P: Plugin>(plugin: &mut P, request: Request) -> Response {
    let Request { id, method, params } = request;

    match method.as_str() {
        INITIALIZE => {
            let plugin_id = params["plugin_id"].as_str().unwrap_or_default();
            match plugin.initialize(plugin_id, &params["config"]) {
                Ok(()) => Response::success(
                    id,
                    json!({ "success": true, "methods": plugin.methods() }),
                ),
                Err(error) => Response::success(id, json!({ "success": false, "error": error })),
            }
        }
        PROCESS => {
            let Some(procedure) = params["procedure"].as_str() else {
                return Response::failure(id, "`process` requires a `procedure` string");
            };
            reply(id, plugin.process(procedure, params["input"].clone(), &params["context"]))
        }
        CLEANUP => {
            plugin.cleanup();
            Response::success(id, Value::Null)
        }
        other if plugin.methods().iter().any(|m| m == other) => {
            reply(id, plugin.process(other, params["input"].clone(), &params["context"]))
        }
        other => Response::failure(id, format!("unknown method `{other}`")),
    }
}

fn reply(id: u64, outcome: Result<Value, String>) -> Response {
    match outcome {
        Ok(value) => Response::success(id, value),
        Err(error) => Response::failure(id, error),
    }
}
