//! Control socket for managing a running daemon
//!
//! A Unix domain socket under `var/`. Each connection carries one JSON
//! request line and gets one JSON response line back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::global::{GlobalSettings, GlobalState};
use crate::module::{ModuleRegistry, ModuleStatus, Params, RouteTable};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request messages sent to the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Names and status of every module
    Modules,

    Status {
        module: String,
    },

    Enable {
        module: String,
        #[serde(default)]
        start: bool,
    },

    Disable {
        module: String,
        #[serde(default)]
        stop: bool,
    },

    Start {
        module: String,
    },

    Stop {
        module: String,
    },

    Restart {
        module: String,
    },

    GetSettings {
        module: String,
        #[serde(default)]
        params: Params,
    },

    SaveSettings {
        module: String,
        #[serde(default)]
        params: Params,
        settings: Value,
    },

    GlobalSettings,

    SaveGlobalSettings {
        settings: GlobalSettings,
    },

    /// Invoke a module-specific route such as `openvpn` `servers/list`
    Call {
        module: String,
        route: String,
        #[serde(default)]
        body: Value,
    },

    /// Request graceful shutdown
    Shutdown,
}

/// Response messages from the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,

    Data {
        value: Value,
    },

    Error {
        message: String,
        #[serde(default)]
        not_found: bool,
    },
}

impl ControlResponse {
    fn from_result(result: Result<Option<Value>>) -> Self {
        match result {
            Ok(None) => ControlResponse::Ok,
            Ok(Some(value)) => ControlResponse::Data { value },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
                not_found: e.is_not_found(),
            },
        }
    }

    /// Convert back into a result on the client side
    pub fn into_result(self) -> Result<Option<Value>> {
        match self {
            ControlResponse::Ok => Ok(None),
            ControlResponse::Data { value } => Ok(Some(value)),
            ControlResponse::Error { message, not_found } => {
                Err(Error::Control { message, not_found })
            }
        }
    }
}

/// Everything a request may touch
pub struct ControlContext {
    pub registry: Arc<ModuleRegistry>,
    pub routes: RouteTable,
    pub global: Arc<GlobalState>,
    pub bus: Arc<EventBus>,
}

impl ControlContext {
    /// Execute one request
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        log::debug!("Control request: {:?}", request);
        ControlResponse::from_result(self.dispatch(request).await)
    }

    async fn dispatch(&self, request: ControlRequest) -> Result<Option<Value>> {
        match request {
            ControlRequest::Modules => {
                let mut modules = serde_json::Map::new();
                for module in self.registry.all() {
                    let status = module.status().await?;
                    modules.insert(module.name().to_string(), serde_json::to_value(status)?);
                }
                Ok(Some(Value::Object(modules)))
            }
            ControlRequest::Status { module } => {
                let status = self.registry.get(&module)?.status().await?;
                Ok(Some(serde_json::to_value(status)?))
            }
            ControlRequest::Enable { module, start } => {
                self.registry.get(&module)?.enable(start).await?;
                Ok(None)
            }
            ControlRequest::Disable { module, stop } => {
                self.registry.get(&module)?.disable(stop).await?;
                Ok(None)
            }
            ControlRequest::Start { module } => {
                self.registry.get(&module)?.start().await?;
                Ok(None)
            }
            ControlRequest::Stop { module } => {
                self.registry.get(&module)?.stop().await?;
                Ok(None)
            }
            ControlRequest::Restart { module } => {
                self.registry.get(&module)?.restart().await?;
                Ok(None)
            }
            ControlRequest::GetSettings { module, params } => {
                Ok(Some(self.registry.get(&module)?.settings(&params).await?))
            }
            ControlRequest::SaveSettings {
                module,
                params,
                settings,
            } => {
                let changed = self
                    .registry
                    .get(&module)?
                    .save_settings(&params, settings)
                    .await?;
                Ok(Some(json!({ "changed": changed })))
            }
            ControlRequest::GlobalSettings => Ok(Some(serde_json::to_value(self.global.get())?)),
            ControlRequest::SaveGlobalSettings { settings } => {
                let changed = self.global.save(settings).await?;
                Ok(Some(json!({ "changed": changed })))
            }
            ControlRequest::Call {
                module,
                route,
                body,
            } => {
                self.registry.get(&module)?;
                Ok(Some(self.routes.call(&module, &route, body).await?))
            }
            ControlRequest::Shutdown => {
                log::info!("Shutdown requested over the control socket");
                let _ = self.bus.publish(Event::new(EventKind::Shutdown));
                Ok(None)
            }
        }
    }
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    context: Arc<ControlContext>,
}

impl ControlServer {
    pub fn new(socket_path: impl AsRef<Path>, context: Arc<ControlContext>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            context,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, then accept connections in a background task
    pub fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let listener = self.bind()?;
        Ok(tokio::spawn(async move { self.serve(listener).await }))
    }

    fn bind(&self) -> Result<UnixListener> {
        use std::os::unix::fs::PermissionsExt;

        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Config(format!("failed to bind control socket: {}", e)))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        log::info!("Control socket listening on {:?}", self.socket_path);
        Ok(listener)
    }

    async fn serve(&self, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &context).await {
                            log::debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control socket accept error: {}", e);
                }
            }
        }
    }

    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(stream: UnixStream, context: &ControlContext) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(request) => context.handle(request).await,
        Err(e) => ControlResponse::Error {
            message: format!("invalid request: {}", e),
            not_found: false,
        },
    };

    let mut response_json = serde_json::to_string(&response)?;
    response_json.push('\n');
    writer.write_all(response_json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Control socket client for a running daemon
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send a request and read the response
    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let transport = |message: String| Error::Control {
            message,
            not_found: false,
        };

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            transport(format!(
                "failed to connect to {:?}: {}. Is the daemon running?",
                self.socket_path, e
            ))
        })?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut request_json = serde_json::to_string(request)?;
        request_json.push('\n');
        writer
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| transport(format!("failed to send request: {}", e)))?;

        let mut line = String::new();
        tokio::time::timeout(CLIENT_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| transport("timeout waiting for response".into()))?
            .map_err(|e| transport(format!("failed to read response: {}", e)))?;

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Send a request, turning an error response into `Err`
    pub async fn call(&self, request: &ControlRequest) -> Result<Option<Value>> {
        self.request(request).await?.into_result()
    }

    pub async fn status(&self, module: &str) -> Result<ModuleStatus> {
        let value = self
            .call(&ControlRequest::Status {
                module: module.to_string(),
            })
            .await?
            .unwrap_or_default();
        Ok(serde_json::from_value(value)?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(&ControlRequest::Shutdown).await?;
        Ok(())
    }
}
