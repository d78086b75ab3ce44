//! Local cluster driver for single-machine development.
//!
//! Workloads are host shell processes instead of remote containers:
//! `create_workload` registers the environment, scaling toggles whether
//! an exec may attach, and `open_exec` spawns a shell whose stdio is
//! bridged onto the exec stream. Production deployments register real
//! clusters through a connector speaking their orchestration API; this
//! driver exists so the whole control path can be exercised on a laptop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use devgrid_cluster::{
    ApiResult, ClusterApi, ClusterApiError, ClusterConnector, ExecInput, ExecStream, Utilization,
    WorkloadPhase, WorkloadSpec,
};
use devgrid_state::ClusterRecord;

/// One registered workload on the local driver.
#[derive(Clone)]
struct LocalWorkload {
    replicas: u32,
}

/// A "cluster" backed by the local machine.
pub struct LocalCluster {
    workloads: Mutex<HashMap<String, LocalWorkload>>,
    shell: String,
}

impl LocalCluster {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            workloads: Mutex::new(HashMap::new()),
            shell: shell.into(),
        }
    }

    fn workload(&self, environment_id: &str) -> Option<LocalWorkload> {
        self.workloads.lock().unwrap().get(environment_id).cloned()
    }
}

#[async_trait]
impl ClusterApi for LocalCluster {
    async fn create_volume(&self, environment_id: &str, _storage_gib: u64) -> ApiResult<()> {
        debug!(%environment_id, "local driver: volume is the host filesystem");
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> ApiResult<()> {
        self.workloads
            .lock()
            .unwrap()
            .insert(spec.environment_id.clone(), LocalWorkload { replicas: 1 });
        Ok(())
    }

    async fn create_entrypoint(&self, environment_id: &str) -> ApiResult<()> {
        debug!(%environment_id, "local driver: no entrypoint needed");
        Ok(())
    }

    async fn scale_workload(&self, environment_id: &str, replicas: u32) -> ApiResult<()> {
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.get_mut(environment_id) {
            Some(workload) => {
                workload.replicas = replicas;
                Ok(())
            }
            // Scaling an absent workload is idempotent for scale-to-zero.
            None if replicas == 0 => Ok(()),
            None => Err(ClusterApiError::NotFound(environment_id.to_string())),
        }
    }

    async fn delete_workload(&self, environment_id: &str) -> ApiResult<()> {
        self.workloads.lock().unwrap().remove(environment_id);
        Ok(())
    }

    async fn delete_entrypoint(&self, _environment_id: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn delete_volume(&self, _environment_id: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn workload_phase(&self, environment_id: &str) -> ApiResult<WorkloadPhase> {
        Ok(match self.workload(environment_id) {
            Some(w) if w.replicas > 0 => WorkloadPhase::Ready,
            Some(_) => WorkloadPhase::Pending,
            None => WorkloadPhase::Absent,
        })
    }

    async fn open_exec(&self, environment_id: &str) -> ApiResult<ExecStream> {
        match self.workload(environment_id) {
            Some(w) if w.replicas > 0 => {}
            _ => return Err(ClusterApiError::NotFound(environment_id.to_string())),
        }

        let mut child = Command::new(&self.shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterApiError::Unavailable(format!("shell spawn failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClusterApiError::Unavailable("no stdin handle".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterApiError::Unavailable("no stdout handle".into()))?;

        let (in_tx, mut in_rx) = mpsc::channel::<ExecInput>(64);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);

        // Input side: write data frames into the shell. There is no pty,
        // so resize is accepted and dropped.
        tokio::spawn(async move {
            while let Some(input) = in_rx.recv().await {
                match input {
                    ExecInput::Data(data) => {
                        if stdin.write_all(&data).await.is_err() {
                            break;
                        }
                        let _ = stdin.flush().await;
                    }
                    ExecInput::Resize { cols, rows } => {
                        debug!(cols, rows, "local driver: resize ignored (no pty)");
                    }
                }
            }
            // Dropping stdin closes the shell's input and lets it exit.
            drop(child);
        });

        // Output side: forward shell stdout in chunks.
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ExecStream {
            input: in_tx,
            output: out_rx,
        })
    }

    async fn utilization(&self, environment_id: &str) -> ApiResult<Utilization> {
        if self.workload(environment_id).is_none() {
            return Err(ClusterApiError::NotFound(environment_id.to_string()));
        }
        // The local driver does not meter host processes.
        Ok(Utilization {
            cpu_millis: 0,
            memory_mib: 0,
            storage_gib: 0,
        })
    }

    async fn ping(&self) -> ApiResult<()> {
        Ok(())
    }
}

/// Connector that serves the same local driver for every cluster record.
pub struct LocalConnector {
    shell: String,
}

impl LocalConnector {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ClusterConnector for LocalConnector {
    fn connect(
        &self,
        cluster: &ClusterRecord,
        _credential: &[u8],
    ) -> anyhow::Result<Arc<dyn ClusterApi>> {
        debug!(cluster_id = %cluster.id, "local driver attached");
        Ok(Arc::new(LocalCluster::new(self.shell.clone())))
    }
}
