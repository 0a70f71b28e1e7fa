use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::config::SiteConfig;
use crate::engine::ContainerEngine;
use crate::scheduler::{run_loop, Scheduler};
use crate::unpack::unpack_loop;

/// Two cooperating workers over one stop flag: the unpack loop and the
/// scheduler loop. An external `stop` line (or SIGINT) requests a graceful
/// shutdown; in-flight container services are left to finish or time out.
pub struct Supervisor {
    site: Arc<SiteConfig>,
    scheduler: Arc<Scheduler>,
    stop: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(site: Arc<SiteConfig>, engine: Arc<dyn ContainerEngine>) -> Self {
        let scheduler = Arc::new(Scheduler::new(site.clone(), engine));
        Self {
            site,
            scheduler,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn end(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub async fn run(&self, sets: Vec<String>) -> Result<()> {
        let unpack = {
            let site = self.site.clone();
            let sets = sets.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move { unpack_loop(&site, &sets, &stop).await })
        };
        let run = {
            let scheduler = self.scheduler.clone();
            let sets = sets.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move { run_loop(&scheduler, &sets, &stop).await })
        };

        self.control().await;
        info!(stopped = self.stopped(), "waiting for workers to drain");

        let _ = unpack.await;
        let _ = run.await;
        info!("supervisor stopped");
        Ok(())
    }

    /// Block until the control stream delivers the literal line `stop` or the
    /// process receives SIGINT, then raise the stop flag.
    async fn control(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) if line.trim() == "stop" => {
                            info!("stop requested on control stream");
                            break;
                        }
                        Ok(Some(_)) => {}
                        // Control stream closed; keep running until a signal.
                        Ok(None) => {
                            let _ = tokio::signal::ctrl_c().await;
                            info!("interrupt received");
                            break;
                        }
                        Err(_) => {
                            let _ = tokio::signal::ctrl_c().await;
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
            }
        }
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::load_sample;
    use crate::engine::fake::FakeEngine;

    #[tokio::test]
    async fn end_raises_the_shared_stop_flag() {
        let dir = tempfile::tempdir().unwrap();
        let site = Arc::new(load_sample(dir.path()));
        let supervisor = Supervisor::new(site, Arc::new(FakeEngine::new()));
        assert!(!supervisor.stopped());
        supervisor.end();
        assert!(supervisor.stopped());
    }
}
