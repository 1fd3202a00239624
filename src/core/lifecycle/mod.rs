use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    StartServices,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    /// Init every component, then start them, then start the job scheduler.
    /// The first failing component aborts startup.
    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle: init ({} components)", self.components.len());
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle: starting services");
        self.state = LifecycleState::StartServices;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;
        info!("Lifecycle: ready, job scheduler running");

        Ok(())
    }

    /// Job scheduler first, then components in reverse attach order.
    /// Errors are logged, not returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle: shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Job scheduler shutdown error: {}", e);
        }
        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct PhaseLog {
        calls: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for PhaseLog {
        async fn on_init(&mut self) -> Result<()> {
            self.calls.push("init");
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.calls.push("start");
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.calls.push("shutdown");
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_see_every_phase_in_order() {
        let phases = Arc::new(Mutex::new(PhaseLog::default()));
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        lifecycle.attach(phases.clone());

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Shutdown);

        assert_eq!(phases.lock().await.calls, vec!["init", "start", "shutdown"]);
    }

    struct Named {
        name: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Named {
        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_attach_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        for name in ["store", "services"] {
            lifecycle.attach(Arc::new(Mutex::new(Named {
                name,
                log: log.clone(),
            })));
        }
        lifecycle.start().await.unwrap();
        lifecycle.shutdown().await.unwrap();
        assert_eq!(*log.lock(), vec!["services", "store"]);
    }
}
