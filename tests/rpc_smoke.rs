//! End-to-end smoke tests over the line-framed JSON-RPC loop (spec.md §8),
//! covering the protocol-level behaviors that don't need a real DWARF
//! fixture: unknown methods, not-found modules, and `quit`.

use std::io::Cursor;

fn roundtrip(requests: &str) -> Vec<serde_json::Value> {
    let mut output = Vec::new();
    wsym_cli::serve(vec![], false, 1, Cursor::new(requests.as_bytes().to_vec()), &mut output).unwrap();
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn unknown_method_is_a_protocol_error() {
    let responses = roundtrip("{\"id\":1,\"method\":\"frobnicate\",\"params\":{}}\n");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["result"]["error"]["code"], "PROTOCOL_ERROR");
}

#[test]
fn add_raw_module_with_garbage_bytes_is_an_internal_error() {
    let request = serde_json::json!({
        "id": 1,
        "method": "addRawModule",
        "params": {"rawModuleId": "m1", "rawModule": {"code": "AAEC"}},
    });
    let responses = roundtrip(&format!("{request}\n"));
    assert_eq!(responses[0]["result"]["error"]["code"], "INTERNAL_ERROR");
}

#[test]
fn evaluate_variable_against_unregistered_module_is_not_found() {
    let request = serde_json::json!({
        "id": 1,
        "method": "evaluateVariable",
        "params": {"name": "x", "location": {"rawModuleId": "nope", "codeOffset": 0}},
    });
    let responses = roundtrip(&format!("{request}\n"));
    assert_eq!(responses[0]["result"]["error"]["code"], "NOT_FOUND");
}

#[test]
fn quit_stops_the_loop_and_sends_no_response() {
    let responses = roundtrip("{\"method\":\"quit\"}\n{\"id\":1,\"method\":\"listVariablesInScope\",\"params\":{}}\n");
    assert!(responses.is_empty());
}

#[test]
fn notifications_other_than_quit_run_but_get_no_reply() {
    let request = serde_json::json!({
        "method": "listVariablesInScope",
        "params": {"rawModuleId": "nope", "codeOffset": 0},
    });
    let responses = roundtrip(&format!("{request}\n"));
    assert!(responses.is_empty());
}
