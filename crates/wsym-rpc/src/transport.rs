//! The line-framed JSON-RPC loop (spec.md §4.6/§5): one request read from
//! the input stream, dispatched to completion, and (if it carried an id)
//! replied to, before the next line is read. No concurrency, no timeouts;
//! `quit` or transport EOF ends the loop.

use std::io::{BufRead, Write};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use wsym_module::SymbolServerError;

use crate::dispatcher::Dispatcher;
use crate::proto::*;

#[derive(Deserialize, Debug)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Runs the dispatcher loop to completion over `input`/`output`. Malformed
/// request lines never abort the server (spec.md §7); if an `id` can be
/// scraped out of the line despite the rest of it failing to parse, a
/// `ProtocolError` reply is still sent for it so the caller sees a
/// response rather than silence. A line that isn't even valid JSON at all
/// has no `id` to reply to and is simply logged and skipped.
pub fn run(dispatcher: &mut Dispatcher, mut input: impl BufRead, mut output: impl Write) -> anyhow::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break; // transport EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(%err, line = trimmed, "malformed request line");
                let id = serde_json::from_str::<Value>(trimmed).ok().and_then(|v| v.get("id").cloned());
                if let Some(id) = id {
                    let result = respond::<()>(Err(SymbolServerError::Protocol(err.to_string())));
                    let response = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": result,
                    });
                    writeln!(output, "{}", serde_json::to_string(&response)?)?;
                    output.flush()?;
                }
                continue;
            }
        };

        if request.method == "quit" {
            break;
        }

        let result = dispatch(dispatcher, &request.method, request.params);
        let Some(id) = request.id else {
            continue; // a notification other than "quit" is ignored
        };

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        writeln!(output, "{}", serde_json::to_string(&response)?)?;
        output.flush()?;
    }
    Ok(())
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, SymbolServerError> {
    serde_json::from_value(params).map_err(|err| SymbolServerError::Protocol(err.to_string()))
}

fn respond<T: serde::Serialize>(result: Result<T, SymbolServerError>) -> Value {
    let envelope: Envelope<T> = result.into();
    serde_json::to_value(envelope).expect("envelope types always serialize")
}

fn dispatch(dispatcher: &mut Dispatcher, method: &str, params: Value) -> Value {
    tracing::debug!(method, "dispatching request");
    match method {
        "addRawModule" => respond(parse_params(params).and_then(|req| dispatcher.add_raw_module(req))),
        "sourceLocationToRawLocation" => {
            respond(parse_params(params).and_then(|loc| dispatcher.source_location_to_raw_location(loc)))
        }
        "rawLocationToSourceLocation" => {
            respond(parse_params(params).and_then(|loc| dispatcher.raw_location_to_source_location(loc)))
        }
        "listVariablesInScope" => {
            respond(parse_params(params).and_then(|loc| dispatcher.list_variables_in_scope(loc)))
        }
        "evaluateVariable" => {
            respond(parse_params(params).and_then(|req| dispatcher.evaluate_variable(req)))
        }
        other => respond::<()>(Err(SymbolServerError::Protocol(format!("unknown method '{other}'")))),
    }
}
