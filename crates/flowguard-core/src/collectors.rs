use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::CollectorSpec;
use crate::pipeline::CollectorHandle;

const MAX_DATAGRAM: usize = 65_536;

pub struct CollectorTasks {
    tasks: JoinSet<()>,
}

impl CollectorTasks {
    pub async fn abort_all_and_wait(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// One UDP listener per configured collector framing. A datagram is one
/// frame; parse failures are counted inside the ingest stage, never fatal.
pub async fn spawn_collectors(
    specs: &[CollectorSpec],
    handle: CollectorHandle,
) -> Result<CollectorTasks> {
    let mut tasks = JoinSet::new();

    for spec in specs {
        let socket = UdpSocket::bind(&spec.bind)
            .await
            .with_context(|| format!("failed binding collector socket {}", spec.bind))?;
        info!(framing = spec.framing.as_str(), bind = %spec.bind, "collector listening");

        let framing = spec.framing;
        let handle = handle.clone();
        tasks.spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, _peer)) => {
                        let _ = handle.ingest_frame(framing, &buffer[..len]).await;
                    }
                    Err(error) => {
                        warn!(framing = framing.as_str(), error = %error, "collector receive failed");
                    }
                }
            }
        });
    }

    Ok(CollectorTasks { tasks })
}
