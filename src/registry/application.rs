use std::{future::Future, sync::Arc};

use log::info;

use super::{Lookup, ScopeTable, SessionRegistry};
use crate::{
    core::{ApplicationDescriptor, Clock, LifecycleError, LifecycleResult, Phase, Signal},
    pipeline::ErrorRouter,
    scope::ApplicationScope,
};

/// Owns the application scope of one descriptor.
///
/// At most one scope is live per descriptor identity. Ending a scope first
/// ends every session created under it.
pub struct ApplicationRegistry {
    table: ScopeTable<ApplicationScope>,
    descriptor: Arc<dyn ApplicationDescriptor>,
    router: Arc<ErrorRouter>,
    sessions: Arc<SessionRegistry>,
}

impl ApplicationRegistry {
    pub fn new(
        descriptor: Arc<dyn ApplicationDescriptor>,
        router: Arc<ErrorRouter>,
        sessions: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table: ScopeTable::new(clock),
            descriptor,
            router,
            sessions,
        }
    }

    /// Return the live application scope, creating it when absent.
    ///
    /// An expired scope is ended before a new one is created. `start` runs
    /// `onApplicationStart` against the fresh scope; only [`Signal::Continue`]
    /// makes it live. Concurrent callers wait for the creation in flight and
    /// share its result.
    pub async fn get_or_create<F, Fut>(&self, start: F) -> LifecycleResult<Arc<ApplicationScope>>
    where
        F: FnOnce(Arc<ApplicationScope>) -> Fut,
        Fut: Future<Output = Signal>,
    {
        let id = self.descriptor.id().to_string();

        let slot = loop {
            match self.table.find_or_reserve(&id) {
                Lookup::Live(scope) => return Ok(scope),
                Lookup::Expired(slot) => {
                    if let Some(expired) = self.table.evict_expired(&id, &slot) {
                        info!("Application '{}' expired", expired.name());
                        self.end_application(expired).await;
                    }
                }
                Lookup::Pending(slot) => break slot,
            }
        };

        let settings = self.descriptor.settings();
        let clock = self.table.clock().clone();
        let scope = slot
            .get_or_try_init(|| async move {
                let scope = Arc::new(ApplicationScope::new(
                    id,
                    settings.name.clone(),
                    settings.application_timeout,
                    clock,
                ));
                match start(scope.clone()).await {
                    Signal::Continue => {
                        info!("Application '{}' started", scope.name());
                        Ok(scope)
                    }
                    Signal::Abort => Err(LifecycleError::ApplicationUnavailable(format!(
                        "{} declined to start '{}'",
                        Phase::ApplicationStart,
                        scope.name()
                    ))),
                    Signal::Fail(e) => Err(LifecycleError::ApplicationUnavailable(e.to_string())),
                }
            })
            .await?;

        Ok(scope.clone())
    }

    /// The live application scope, without touching it
    pub fn current(&self) -> Option<Arc<ApplicationScope>> {
        self.table.peek(self.descriptor.id())
    }

    pub fn live_count(&self) -> usize {
        self.table.live_count()
    }

    /// End the application scope if it has idled past its timeout
    pub async fn sweep(&self) -> usize {
        let mut ended = 0;
        for (id, slot) in self.table.expired() {
            if let Some(expired) = self.table.evict_expired(&id, &slot) {
                info!("Application '{}' expired", expired.name());
                self.end_application(expired).await;
                ended += 1;
            }
        }
        ended
    }

    /// End every live application scope regardless of idle time
    pub async fn end_all(&self) -> usize {
        let mut ended = 0;
        for (id, slot) in self.table.matching(|_| true) {
            if let Some(application) = self.table.evict(&id, &slot) {
                self.end_application(application).await;
                ended += 1;
            }
        }
        ended
    }

    async fn end_application(&self, application: Arc<ApplicationScope>) {
        let sessions = self.sessions.end_owned_by(&application).await;
        info!(
            "Ending application '{}' after {sessions} session(s)",
            application.name()
        );

        let teardown = self.descriptor.on_application_end(&application);
        if let Err(e) = self.router.guard(Phase::ApplicationEnd, teardown).await {
            self.router.route(&e, None, None).await;
        }
    }
}
