use std::{future::Future, sync::Arc};

use log::{debug, info};

use super::{Lookup, ScopeTable};
use crate::{
    core::{ApplicationDescriptor, Clock, LifecycleResult, Phase},
    pipeline::ErrorRouter,
    scope::{ApplicationScope, SessionScope},
};

/// Session resolved for a request.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub scope: Arc<SessionScope>,
    /// `true` when the session was created for this request and its token
    /// still has to reach the client
    pub created: bool,
}

/// Creates, looks up and expires session scopes keyed by token.
pub struct SessionRegistry {
    table: ScopeTable<SessionScope>,
    descriptor: Arc<dyn ApplicationDescriptor>,
    router: Arc<ErrorRouter>,
}

impl SessionRegistry {
    pub fn new(
        descriptor: Arc<dyn ApplicationDescriptor>,
        router: Arc<ErrorRouter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table: ScopeTable::new(clock),
            descriptor,
            router,
        }
    }

    /// Find the session for `presented`, creating a new one when needed.
    ///
    /// An absent, unknown, or expired token yields a freshly minted token; an
    /// expired session is ended before its replacement starts. `start` runs
    /// `onSessionStart` against the new scope; if it fails the scope is
    /// discarded.
    pub async fn resolve<F, Fut>(
        &self,
        application: &Arc<ApplicationScope>,
        presented: Option<&str>,
        start: F,
    ) -> LifecycleResult<ResolvedSession>
    where
        F: FnOnce(Arc<SessionScope>) -> Fut,
        Fut: Future<Output = LifecycleResult<()>>,
    {
        if let Some(token) = presented {
            match self.table.find(token) {
                Some(Lookup::Live(scope)) if Arc::ptr_eq(scope.application(), application) => {
                    debug!("Resuming session {token}");
                    return Ok(ResolvedSession {
                        scope,
                        created: false,
                    });
                }
                Some(Lookup::Live(scope)) => {
                    // created under an application that has since been replaced
                    if let Some(stale) = self.table.evict_scope(token, &scope) {
                        info!("Session {token} outlived its application, ending it");
                        self.end_session(stale).await;
                    }
                }
                Some(Lookup::Expired(slot)) => {
                    if let Some(expired) = self.table.evict_expired(token, &slot) {
                        info!("Session {token} expired");
                        self.end_session(expired).await;
                    }
                }
                Some(Lookup::Pending(_)) | None => {
                    debug!("Unknown session token presented, starting a new session");
                }
            }
        }

        self.create(application, start).await
    }

    async fn create<F, Fut>(
        &self,
        application: &Arc<ApplicationScope>,
        start: F,
    ) -> LifecycleResult<ResolvedSession>
    where
        F: FnOnce(Arc<SessionScope>) -> Fut,
        Fut: Future<Output = LifecycleResult<()>>,
    {
        let (token, slot) = self.table.reserve_new(mint_token);
        let timeout = self.descriptor.settings().session_timeout;
        let clock = self.table.clock().clone();
        let application = application.clone();
        let scope_token = token.clone();

        let created = slot
            .get_or_try_init(|| async move {
                let scope = Arc::new(SessionScope::new(scope_token, timeout, application, clock));
                start(scope.clone()).await.map(|()| scope)
            })
            .await;

        match created {
            Ok(scope) => {
                info!("Session {token} started");
                Ok(ResolvedSession {
                    scope: scope.clone(),
                    created: true,
                })
            }
            Err(e) => {
                self.table.discard(&token, &slot);
                Err(e)
            }
        }
    }

    /// The live session for `token`, without touching it
    pub fn get(&self, token: &str) -> Option<Arc<SessionScope>> {
        self.table.peek(token)
    }

    pub fn live_count(&self) -> usize {
        self.table.live_count()
    }

    /// End every session that has idled past its timeout.
    ///
    /// Returns the number of sessions ended. A failing `onSessionEnd` is routed
    /// and does not stop the sweep.
    pub async fn sweep(&self) -> usize {
        let mut ended = 0;
        for (token, slot) in self.table.expired() {
            // earlier teardowns may have touched this one since the scan
            if let Some(expired) = self.table.evict_expired(&token, &slot) {
                info!("Session {token} expired");
                self.end_session(expired).await;
                ended += 1;
            }
        }
        ended
    }

    /// End every session created under `application`
    pub async fn end_owned_by(&self, application: &Arc<ApplicationScope>) -> usize {
        let owned = self
            .table
            .matching(|session| Arc::ptr_eq(session.application(), application));
        self.end_slots(owned).await
    }

    /// End every live session
    pub async fn end_all(&self) -> usize {
        let all = self.table.matching(|_| true);
        self.end_slots(all).await
    }

    async fn end_slots(&self, slots: Vec<(String, super::Slot<SessionScope>)>) -> usize {
        let mut ended = 0;
        for (token, slot) in slots {
            if let Some(session) = self.table.evict(&token, &slot) {
                self.end_session(session).await;
                ended += 1;
            }
        }
        ended
    }

    async fn end_session(&self, session: Arc<SessionScope>) {
        let teardown = self
            .descriptor
            .on_session_end(session.application(), &session);
        if let Err(e) = self.router.guard(Phase::SessionEnd, teardown).await {
            self.router.route(&e, None, None).await;
        }
    }
}

fn mint_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
