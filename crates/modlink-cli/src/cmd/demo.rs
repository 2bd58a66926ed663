use modlink_runtime::{run_module, ConnectionParams};
use std::path::PathBuf;

pub fn run(
    manifest_path: PathBuf,
    connection_id: String,
    verification_token: String,
) -> anyhow::Result<()> {
    let params = ConnectionParams {
        manifest_path,
        connection_id,
        verification_token,
    };
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_module(params, crate::demo::Counter::new))?;
    Ok(())
}
