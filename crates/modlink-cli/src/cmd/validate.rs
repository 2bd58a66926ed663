use crate::output::print_json;
use modlink_core::config::Manifest;
use modlink_core::API_VERSION;
use modlink_runtime::StartupError;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ValidateReport<'a> {
    valid: bool,
    id: &'a str,
    name: &'a str,
    version: &'a str,
    api: &'a str,
    call_timeout_ms: u64,
}

pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(path).map_err(StartupError::Manifest)?;
    manifest
        .validate(API_VERSION)
        .map_err(StartupError::Manifest)?;

    if json {
        return print_json(&ValidateReport {
            valid: true,
            id: &manifest.id,
            name: &manifest.name,
            version: &manifest.version,
            api: &manifest.runtime.api,
            call_timeout_ms: manifest.settings.call_timeout_ms,
        });
    }

    println!(
        "{} {} ({}): ok, api {} (runtime speaks {API_VERSION})",
        manifest.id, manifest.version, manifest.name, manifest.runtime.api
    );
    Ok(())
}
