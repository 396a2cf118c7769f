use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use tokio::time::{interval, MissedTickBehavior};

use crate::pipeline::RequestPipeline;

/// Background service that expires idle scopes.
///
/// Sweeps sessions and then applications every `interval`. When the server
/// shuts down every live scope is ended.
pub struct ExpirySweeper {
    pipeline: Arc<RequestPipeline>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(pipeline: Arc<RequestPipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }
}

#[async_trait]
impl BackgroundService for ExpirySweeper {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    let report = self.pipeline.sweep().await;
                    if report.total() > 0 {
                        log::info!(
                            "Expired {} session(s) and {} application(s)",
                            report.sessions,
                            report.applications
                        );
                    }
                }
            }
        }

        log::info!("Shutting down, ending live scopes...");
        self.pipeline.shutdown().await;
    }
}
