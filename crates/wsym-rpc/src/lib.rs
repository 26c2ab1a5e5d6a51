//! The line-framed JSON-RPC dispatcher (spec.md §4.6): wire types in
//! [`proto`], request handling in [`dispatcher`], the read-dispatch-reply
//! loop in [`transport`].

pub mod dispatcher;
pub mod proto;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use transport::run;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use wsym_module::ModuleCache;

    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(ModuleCache::new(vec![], false), dispatcher::DEFAULT_SCRATCH_PAD_PAGES)
    }

    #[test]
    fn unknown_method_yields_protocol_error() {
        let mut dispatcher = dispatcher();
        let input = Cursor::new(b"{\"id\":1,\"method\":\"doesNotExist\",\"params\":{}}\n".to_vec());
        let mut output = Vec::new();
        run(&mut dispatcher, input, &mut output).unwrap();

        let response: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(response["result"]["error"]["code"], "PROTOCOL_ERROR");
    }

    #[test]
    fn missing_module_yields_not_found() {
        let mut dispatcher = dispatcher();
        let request = serde_json::json!({
            "id": 1,
            "method": "listVariablesInScope",
            "params": {"rawModuleId": "missing", "codeOffset": 0},
        });
        let input = Cursor::new(format!("{request}\n").into_bytes());
        let mut output = Vec::new();
        run(&mut dispatcher, input, &mut output).unwrap();

        let response: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(response["result"]["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn malformed_json_line_does_not_abort_the_loop() {
        let mut dispatcher = dispatcher();
        let input = Cursor::new(b"not json at all\n{\"id\":1,\"method\":\"quit\"}\n".to_vec());
        let mut output = Vec::new();
        assert!(run(&mut dispatcher, input, &mut output).is_ok());
    }

    #[test]
    fn quit_ends_the_loop_without_a_response() {
        let mut dispatcher = dispatcher();
        let input = Cursor::new(b"{\"method\":\"quit\"}\nunreachable garbage\n".to_vec());
        let mut output = Vec::new();
        run(&mut dispatcher, input, &mut output).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn notifications_other_than_quit_are_silently_ignored() {
        let mut dispatcher = dispatcher();
        let input = Cursor::new(b"{\"method\":\"listVariablesInScope\",\"params\":{\"rawModuleId\":\"x\",\"codeOffset\":0}}\n".to_vec());
        let mut output = Vec::new();
        run(&mut dispatcher, input, &mut output).unwrap();
        assert!(output.is_empty());
    }
}
