//! Process startup: manifest validation, the registration handshake and the
//! stdio channel.

use std::path::PathBuf;
use std::sync::Arc;

use modlink_core::config::Manifest;
use modlink_core::messages::{method, RegisterMessage};
use modlink_core::{ModlinkError, API_VERSION};
use modlink_ipc::{run_line_channel, Transport};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info};

use crate::api::ModuleApi;
use crate::host::HostLink;
use crate::lifecycle::ModuleRuntime;
use crate::module::Module;

pub const ENV_MANIFEST: &str = "MODULE_MANIFEST";
pub const ENV_CONNECTION_ID: &str = "CONNECTION_ID";
pub const ENV_VERIFICATION_TOKEN: &str = "VERIFICATION_TOKEN";

/// Exit status when the manifest or environment is unusable.
pub const EXIT_MANIFEST: i32 = 11;
/// Exit status when the host rejects the registration handshake.
pub const EXIT_REGISTRATION: i32 = 12;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("{0}")]
    Manifest(#[source] ModlinkError),

    #[error("registration failed: {0}")]
    Registration(#[source] ModlinkError),

    #[error("ipc channel failed: {0}")]
    Channel(#[source] ModlinkError),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::MissingEnv(_) | StartupError::Manifest(_) => EXIT_MANIFEST,
            StartupError::Registration(_) => EXIT_REGISTRATION,
            StartupError::Channel(_) => 1,
        }
    }
}

/// What the host hands a freshly spawned module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub manifest_path: PathBuf,
    pub connection_id: String,
    pub verification_token: String,
}

impl ConnectionParams {
    pub fn from_env() -> Result<Self, StartupError> {
        fn var(name: &'static str) -> Result<String, StartupError> {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(StartupError::MissingEnv(name))
        }
        Ok(Self {
            manifest_path: PathBuf::from(var(ENV_MANIFEST)?),
            connection_id: var(ENV_CONNECTION_ID)?,
            verification_token: var(ENV_VERIFICATION_TOKEN)?,
        })
    }
}

/// Run a module over `reader`/`writer` until the host closes the channel.
///
/// `factory` receives the module's [`ModuleApi`] and builds the module; it
/// runs before registration so definitions can be set up front.
pub async fn serve<R, W, F, M>(
    manifest: &Manifest,
    params: &ConnectionParams,
    reader: R,
    writer: W,
    factory: F,
) -> Result<(), StartupError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(ModuleApi) -> M,
    M: Module,
{
    manifest
        .validate(API_VERSION)
        .map_err(StartupError::Manifest)?;

    let settings = &manifest.settings;
    let (transport, outbound) = Transport::channel(settings.call_timeout());
    let host: Arc<dyn HostLink> = Arc::new(transport.clone());
    let api = ModuleApi::new(host, settings);
    let module: Arc<dyn Module> = Arc::new(factory(api.clone()));
    let runtime = ModuleRuntime::new(module, api);
    runtime.register_handlers(&transport);

    let channel = tokio::spawn(run_line_channel(reader, writer, transport.clone(), outbound));

    let register = RegisterMessage {
        api_version: API_VERSION.to_string(),
        connection_id: params.connection_id.clone(),
        verification_token: params.verification_token.clone(),
    };
    if let Err(e) = transport.call::<_, Value>(method::REGISTER, &register).await {
        error!(error = %e, "registration rejected");
        channel.abort();
        return Err(StartupError::Registration(e));
    }
    info!(module = %manifest.id, connection = %params.connection_id, "registered with host");

    match channel.await {
        Ok(result) => result.map_err(StartupError::Channel),
        Err(e) => Err(StartupError::Channel(ModlinkError::Callback(format!(
            "channel task failed: {e}"
        )))),
    }
}

/// Load the manifest named by `params` and serve the module on stdin/stdout.
pub async fn run_module<F, M>(params: ConnectionParams, factory: F) -> Result<(), StartupError>
where
    F: FnOnce(ModuleApi) -> M,
    M: Module,
{
    let manifest = Manifest::load(&params.manifest_path).map_err(StartupError::Manifest)?;
    serve(
        &manifest,
        &params,
        tokio::io::stdin(),
        tokio::io::stdout(),
        factory,
    )
    .await
}
