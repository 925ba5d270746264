pub mod history;
pub mod monitor;
pub mod probes;
pub mod settings;
pub mod warner;

use anyhow::Result;
use log::info;
use tokio::{signal, time};

pub use crate::{
    monitor::Monitor,
    probes::Sample,
    settings::{MonitorConfig, Settings, Thresholds},
    warner::{LogWarner, Warner},
};

/// Runs a monitor in the foreground until Ctrl-C, checking it on a fixed
/// period with the log sink.
pub struct SchedProbeEngine {
    pub settings: Settings,
    config: MonitorConfig,
}

impl SchedProbeEngine {
    pub fn new(settings: Settings) -> Result<Self> {
        let config = settings.to_monitor_config()?;
        Ok(Self { settings, config })
    }

    pub async fn run(self) -> Result<()> {
        let monitor = Monitor::start(self.config)?;
        let mut checks = time::interval(self.settings.check_interval());

        info!("Monitoring active. Press Ctrl-C to exit.");
        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = checks.tick() => {
                    monitor.check(&LogWarner).await;
                }
                res = &mut ctrl_c => {
                    res?;
                    break;
                }
            }
        }

        info!("Exiting...");
        info!("Last {} samples:\n{}", monitor.history_len(), monitor.samples());
        monitor.shutdown().await;

        Ok(())
    }
}
