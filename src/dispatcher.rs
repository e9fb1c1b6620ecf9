//! Lifecycle dispatcher.
//!
//! Routes a decoded envelope to the handler registered for its phase. The
//! phase-to-handler mapping is immutable, built once at startup, and owned
//! by the dispatcher; there is no ambient registration. The platform
//! guarantees phase ordering per installation, so the dispatcher does not
//! track or reject out-of-order phases — each handler must be safe to
//! invoke in isolation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::lifecycle::{LifecyclePhase, LifecycleRequest, LifecycleResponse};

/// A routing or handler fault. Authentication and decode failures never
/// reach this layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler registered for the phase. A coding/configuration defect,
    /// fatal and never retried.
    #[error("no handler registered for phase {0}")]
    NoHandler(LifecyclePhase),

    /// A CONFIGURATION page request named a page we do not have.
    #[error("unknown configuration page: {0:?}")]
    UnknownPage(String),

    /// The phase handler itself failed.
    #[error("handler failed: {0:#}")]
    HandlerFailed(#[from] anyhow::Error),
}

/// A handler for exactly one lifecycle phase.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError>;
}

/// Immutable mapping from phase to handler.
pub type HandlerMap = HashMap<LifecyclePhase, Arc<dyn PhaseHandler>>;

pub struct Dispatcher {
    handlers: HandlerMap,
}

impl Dispatcher {
    /// Build a dispatcher over a handler map. No handler may serve more
    /// than one phase; the map shape enforces one handler per phase.
    pub fn new(handlers: HandlerMap) -> Self {
        Dispatcher { handlers }
    }

    /// Route the envelope to its phase handler. Exactly one handler is
    /// invoked per request.
    pub async fn dispatch(
        &self,
        request: &LifecycleRequest,
    ) -> Result<LifecycleResponse, DispatchError> {
        let phase = request.phase();
        let handler = self
            .handlers
            .get(&phase)
            .ok_or(DispatchError::NoHandler(phase))?;
        info!(
            phase = %phase,
            execution_id = %request.execution_id(),
            "dispatching lifecycle request"
        );
        handler.handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testdata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records which phase it was registered for and how often it ran.
    struct Recorder {
        registered_for: LifecyclePhase,
        invocations: AtomicUsize,
        mismatches: AtomicUsize,
    }

    impl Recorder {
        fn new(phase: LifecyclePhase) -> Arc<Self> {
            Arc::new(Recorder {
                registered_for: phase,
                invocations: AtomicUsize::new(0),
                mismatches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PhaseHandler for Recorder {
        async fn handle(
            &self,
            request: &LifecycleRequest,
        ) -> Result<LifecycleResponse, DispatchError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if request.phase() != self.registered_for {
                self.mismatches.fetch_add(1, Ordering::SeqCst);
            }
            Ok(LifecycleResponse::uninstall())
        }
    }

    const PHASES: [LifecyclePhase; 7] = [
        LifecyclePhase::Confirmation,
        LifecyclePhase::Configuration,
        LifecyclePhase::Install,
        LifecyclePhase::Update,
        LifecyclePhase::Event,
        LifecyclePhase::OauthCallback,
        LifecyclePhase::Uninstall,
    ];

    #[tokio::test]
    async fn every_phase_invokes_exactly_its_own_handler() {
        let recorders: Vec<Arc<Recorder>> = PHASES.iter().map(|p| Recorder::new(*p)).collect();
        let map: HandlerMap = recorders
            .iter()
            .map(|r| (r.registered_for, r.clone() as Arc<dyn PhaseHandler>))
            .collect();
        let dispatcher = Dispatcher::new(map);

        for phase in PHASES {
            dispatcher
                .dispatch(&testdata::request(phase))
                .await
                .unwrap();
        }

        for recorder in &recorders {
            assert_eq!(
                recorder.invocations.load(Ordering::SeqCst),
                1,
                "{} handler should run exactly once",
                recorder.registered_for
            );
            assert_eq!(
                recorder.mismatches.load(Ordering::SeqCst),
                0,
                "{} handler saw a cross-phase envelope",
                recorder.registered_for
            );
        }
    }

    #[tokio::test]
    async fn missing_handler_is_a_fatal_dispatch_error() {
        let dispatcher = Dispatcher::new(HandlerMap::new());
        let result = dispatcher
            .dispatch(&testdata::request(LifecyclePhase::Uninstall))
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::NoHandler(LifecyclePhase::Uninstall))
        ));
    }

    #[tokio::test]
    async fn handler_faults_propagate_as_handler_failed() {
        struct Failing;

        #[async_trait]
        impl PhaseHandler for Failing {
            async fn handle(
                &self,
                _request: &LifecycleRequest,
            ) -> Result<LifecycleResponse, DispatchError> {
                Err(DispatchError::HandlerFailed(anyhow::anyhow!("boom")))
            }
        }

        let mut map = HandlerMap::new();
        map.insert(LifecyclePhase::Uninstall, Arc::new(Failing));
        let dispatcher = Dispatcher::new(map);
        let result = dispatcher
            .dispatch(&testdata::request(LifecyclePhase::Uninstall))
            .await;
        assert!(matches!(result, Err(DispatchError::HandlerFailed(_))));
    }
}
