//! Docker Engine API runtime, via bollard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, ResizeContainerTtyOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::{ClientVersion, Docker};
use futures_util::StreamExt;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    AttachedStream, ContainerDetails, ContainerRuntime, ContainerSummary, ExecSpec, ExecState,
    HelperSpec, OutputChunk, OutputStream, RuntimeConnector,
};
use crate::session::WindowSize;

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

fn chunk(output: LogOutput) -> OutputChunk {
    match output {
        LogOutput::StdErr { message } => OutputChunk::Stderr(message),
        LogOutput::StdOut { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => OutputChunk::Stdout(message),
    }
}

fn output_stream<S>(stream: S) -> OutputStream
where
    S: futures_core::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send + 'static,
{
    stream
        .map(|item| item.map(chunk).map_err(RuntimeError::from))
        .boxed()
}

/// Runtime on one Docker host reached over plain TCP.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(
        host: &str,
        port: u16,
        api_version: (usize, usize),
        timeout: Duration,
    ) -> RuntimeResult<Self> {
        let addr = format!("tcp://{host}:{port}");
        let version = ClientVersion {
            major_version: api_version.0,
            minor_version: api_version.1,
        };
        let docker = Docker::connect_with_http(&addr, timeout.as_secs().max(1), &version)
            .map_err(|e| RuntimeError::Connect {
                host: addr.clone(),
                reason: e.to_string(),
            })?;
        debug!(%addr, "docker client ready");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let pid = info.state.as_ref().and_then(|s| s.pid);
        let global_ipv6 = info
            .network_settings
            .as_ref()
            .and_then(|n| n.global_ipv6_address.clone())
            .filter(|ip| !ip.is_empty());
        let raw = serde_json::to_value(&info).map_err(|e| RuntimeError::Api(e.to_string()))?;
        Ok(ContainerDetails {
            pid,
            global_ipv6,
            raw,
        })
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> RuntimeResult<String> {
        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            cmd: Some(spec.cmd.clone()),
            user: spec.user.clone(),
            ..Default::default()
        };
        Ok(self.docker.create_exec(container, options).await?.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> RuntimeResult<AttachedStream> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };
        match self.docker.start_exec(exec_id, Some(options)).await? {
            StartExecResults::Attached { output, input } => Ok(AttachedStream {
                output: output_stream(output),
                input,
            }),
            StartExecResults::Detached => {
                Err(RuntimeError::Api(format!("exec {exec_id} started detached")))
            }
        }
    }

    async fn resize_exec(&self, exec_id: &str, size: WindowSize) -> RuntimeResult<()> {
        let options = ResizeExecOptions {
            height: size.rows,
            width: size.cols,
        };
        self.docker.resize_exec(exec_id, options).await?;
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<ExecState> {
        let info = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecState {
            running: info.running.unwrap_or(false),
            exit_code: info.exit_code,
        })
    }

    async fn attach_container(&self, id: &str, stdin: bool) -> RuntimeResult<AttachedStream> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(stdin),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } =
            self.docker.attach_container(id, Some(options)).await?;
        Ok(AttachedStream {
            output: output_stream(output),
            input,
        })
    }

    async fn resize_container(&self, id: &str, size: WindowSize) -> RuntimeResult<()> {
        let options = ResizeContainerTtyOptions {
            width: size.cols,
            height: size.rows,
        };
        self.docker.resize_container_tty(id, options).await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut waits = Box::pin(self.docker.wait_container(id, Some(options)));
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Api(format!("wait on {id} ended without a result"))),
        }
    }

    async fn logs(&self, id: &str, follow: bool, tail: u32) -> RuntimeResult<OutputStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        Ok(output_stream(self.docker.logs(id, Some(options))))
    }

    async fn create_container(&self, spec: &HelperSpec) -> RuntimeResult<String> {
        let host_config = HostConfig {
            privileged: Some(true),
            userns_mode: Some("host".to_string()),
            pid_mode: Some("host".to_string()),
            network_mode: Some("host".to_string()),
            binds: Some(spec.binds.clone()),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            tty: Some(spec.tty),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

/// Connects to `tcp://<node>:<port>` with a fixed API version.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    pub port: u16,
    pub api_version: (usize, usize),
    pub timeout: Duration,
}

impl RuntimeConnector for DockerConnector {
    fn connect(&self, host: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        let runtime = DockerRuntime::connect(host, self.port, self.api_version, self.timeout)?;
        Ok(Arc::new(runtime))
    }
}
