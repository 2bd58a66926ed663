//! Test double for [`HostLink`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use modlink_core::messages::{method, ParseVariablesInStringMessage, ParseVariablesInStringResponse};
use modlink_core::Result;
use parking_lot::Mutex;
use serde_json::Value;

use crate::host::HostLink;

/// Records every message and answers `parseVariablesInString` by
/// substituting `$(id)` references from an in-memory table.
#[derive(Default)]
pub(crate) struct RecordingHost {
    sent: Mutex<Vec<(String, Value)>>,
    calls: Mutex<Vec<(String, Value)>>,
    variables: Mutex<HashMap<String, String>>,
}

impl RecordingHost {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_variable(&self, id: &str, value: &str) {
        self.variables.lock().insert(id.to_string(), value.to_string());
    }

    /// Payloads of every one-way message named `name`, oldest first.
    pub(crate) fn sent(&self, name: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub(crate) fn calls(&self, name: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn parse(&self, text: &str) -> ParseVariablesInStringResponse {
        let variables = self.variables.lock();
        let mut out = String::new();
        let mut ids = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let id = &after[..end];
            out.push_str(variables.get(id).map(String::as_str).unwrap_or(""));
            ids.push(id.to_string());
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        ParseVariablesInStringResponse {
            text: out,
            variable_ids: ids,
        }
    }
}

#[async_trait]
impl HostLink for RecordingHost {
    fn send(&self, name: &str, payload: Value) -> Result<()> {
        self.sent.lock().push((name.to_string(), payload));
        Ok(())
    }

    async fn call(&self, name: &str, payload: Value) -> Result<Value> {
        self.calls.lock().push((name.to_string(), payload.clone()));
        if name == method::PARSE_VARIABLES_IN_STRING {
            let msg: ParseVariablesInStringMessage = serde_json::from_value(payload)?;
            return Ok(serde_json::to_value(self.parse(&msg.text))?);
        }
        Ok(Value::Null)
    }
}

#[test]
fn parse_substitutes_and_reports_ids() {
    let host = RecordingHost::default();
    host.set_variable("mixer:gain", "-3");
    let res = host.parse("gain $(mixer:gain) dB, mute $(mixer:mute)");
    assert_eq!(res.text, "gain -3 dB, mute ");
    assert_eq!(res.variable_ids, vec!["mixer:gain", "mixer:mute"]);
}
