use crate::output::print_json;
use modlink_core::config::{RuntimeSettings, RUNTIME_TYPE};
use modlink_core::API_VERSION;
use serde_json::json;

pub fn run(json: bool) -> anyhow::Result<()> {
    let defaults = RuntimeSettings::default();
    if json {
        return print_json(&json!({
            "apiVersion": API_VERSION,
            "runtimeType": RUNTIME_TYPE,
            "defaults": defaults,
        }));
    }
    println!("api version:  {API_VERSION}");
    println!("runtime type: {RUNTIME_TYPE}");
    println!("call timeout: {}ms", defaults.call_timeout_ms);
    println!(
        "feedback debounce: {}ms (max {}ms)",
        defaults.feedback_debounce_ms, defaults.feedback_max_wait_ms
    );
    Ok(())
}
