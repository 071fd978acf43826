//! VPN consent negotiation.
//!
//! At most one consent request is outstanding at a time. The caller that
//! launched it is suspended until the platform reports the user's answer
//! through [`PermissionNegotiator::on_consent_result`].

use crate::error::{SessionError, SessionResult};
use crate::platform::ConsentPlatform;
use crate::types::PermissionStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Result of [`PermissionNegotiator::check_or_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentOutcome {
    Granted,
    Denied,
    /// The prompt could not be shown; nothing was decided
    PendingUserAction,
}

struct PendingRequest {
    id: u64,
    reply: oneshot::Sender<bool>,
}

struct NegotiatorState {
    status: PermissionStatus,
    pending: Option<PendingRequest>,
    next_id: u64,
}

/// Serializes consent requests and caches their outcome.
pub struct PermissionNegotiator {
    consent: Arc<dyn ConsentPlatform>,
    state: Mutex<NegotiatorState>,
}

/// Frees the pending slot if the waiting caller goes away.
struct SlotGuard<'a> {
    negotiator: &'a PermissionNegotiator,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.negotiator.lock();
        if state.pending.as_ref().map(|p| p.id) == Some(self.id) {
            state.pending = None;
        }
    }
}

impl PermissionNegotiator {
    /// Create a negotiator seeded from the platform's current answer.
    pub async fn new(consent: Arc<dyn ConsentPlatform>) -> Self {
        let status = if consent.consent_granted().await {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Pending
        };
        debug!(?status, "Seeded permission status");

        Self {
            consent,
            state: Mutex::new(NegotiatorState {
                status,
                pending: None,
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NegotiatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> PermissionStatus {
        self.lock().status
    }

    /// Whether a consent prompt is waiting on the user.
    pub fn is_negotiating(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Confirm consent, prompting the user if the platform has none on record.
    pub async fn check_or_request(&self) -> SessionResult<ConsentOutcome> {
        // Claim the slot before any await so a second caller cannot slip in
        let (id, reply) = {
            let mut state = self.lock();
            if state.pending.is_some() {
                return Err(SessionError::NegotiationInProgress);
            }
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending = Some(PendingRequest { id, reply: tx });
            (id, rx)
        };
        let _slot = SlotGuard { negotiator: self, id };

        if self.consent.consent_granted().await {
            self.lock().status = PermissionStatus::Granted;
            return Ok(ConsentOutcome::Granted);
        }

        self.lock().status = PermissionStatus::Pending;
        info!("Requesting VPN consent from the user");

        if let Err(e) = self.consent.launch_consent_flow().await {
            warn!("Consent prompt could not be shown: {}", e);
            return Ok(ConsentOutcome::PendingUserAction);
        }

        match reply.await {
            Ok(true) => Ok(ConsentOutcome::Granted),
            Ok(false) => Ok(ConsentOutcome::Denied),
            Err(_) => Ok(ConsentOutcome::PendingUserAction),
        }
    }

    /// Deliver the user's answer to the outstanding request.
    ///
    /// Returns `false` when no request was waiting; the answer is then ignored.
    pub fn on_consent_result(&self, granted: bool) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending.take() else {
            warn!(granted, "Consent result arrived with no request outstanding");
            return false;
        };

        state.status = if granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        info!(status = ?state.status, "VPN consent answered");

        if pending.reply.send(granted).is_err() {
            debug!("Consent requester went away before the answer arrived");
        }
        true
    }

    /// Drop a cached grant the platform no longer honours.
    pub async fn recheck_consent(&self) {
        if self.status() != PermissionStatus::Granted {
            return;
        }

        if !self.consent.consent_granted().await {
            let mut state = self.lock();
            if state.status == PermissionStatus::Granted {
                info!("VPN consent no longer granted by the platform");
                state.status = PermissionStatus::Pending;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformError, PlatformResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedConsent {
        granted: AtomicBool,
        refuse_prompt: AtomicBool,
        prompts: AtomicUsize,
        prompted: Notify,
    }

    #[async_trait]
    impl ConsentPlatform for ScriptedConsent {
        async fn consent_granted(&self) -> bool {
            self.granted.load(Ordering::SeqCst)
        }

        async fn launch_consent_flow(&self) -> PlatformResult<()> {
            if self.refuse_prompt.load(Ordering::SeqCst) {
                return Err(PlatformError::Unsupported("no user interface".into()));
            }
            self.prompts.fetch_add(1, Ordering::SeqCst);
            self.prompted.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_granted_without_prompt() {
        let consent = Arc::new(ScriptedConsent::default());
        consent.granted.store(true, Ordering::SeqCst);
        let negotiator = PermissionNegotiator::new(consent.clone()).await;

        assert_eq!(negotiator.status(), PermissionStatus::Granted);
        assert_eq!(
            negotiator.check_or_request().await.unwrap(),
            ConsentOutcome::Granted
        );
        assert_eq!(consent.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_request_is_rejected_while_pending() {
        let consent = Arc::new(ScriptedConsent::default());
        let negotiator = Arc::new(PermissionNegotiator::new(consent.clone()).await);
        assert_eq!(negotiator.status(), PermissionStatus::Pending);

        let first = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.check_or_request().await })
        };
        consent.prompted.notified().await;

        let second = negotiator.check_or_request().await;
        assert!(matches!(second, Err(SessionError::NegotiationInProgress)));

        assert!(negotiator.on_consent_result(true));
        assert_eq!(first.await.unwrap().unwrap(), ConsentOutcome::Granted);
        assert_eq!(negotiator.status(), PermissionStatus::Granted);
        assert!(!negotiator.is_negotiating());
    }

    #[tokio::test]
    async fn test_denial_resolves_once() {
        let consent = Arc::new(ScriptedConsent::default());
        let negotiator = Arc::new(PermissionNegotiator::new(consent.clone()).await);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.check_or_request().await })
        };
        consent.prompted.notified().await;

        assert!(negotiator.on_consent_result(false));
        // A late duplicate answer has nobody to resolve
        assert!(!negotiator.on_consent_result(true));

        assert_eq!(request.await.unwrap().unwrap(), ConsentOutcome::Denied);
        assert_eq!(negotiator.status(), PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_prompt_unavailable() {
        let consent = Arc::new(ScriptedConsent::default());
        consent.refuse_prompt.store(true, Ordering::SeqCst);
        let negotiator = PermissionNegotiator::new(consent).await;

        assert_eq!(
            negotiator.check_or_request().await.unwrap(),
            ConsentOutcome::PendingUserAction
        );
        assert_eq!(negotiator.status(), PermissionStatus::Pending);
        assert!(!negotiator.is_negotiating());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_frees_slot() {
        let consent = Arc::new(ScriptedConsent::default());
        let negotiator = Arc::new(PermissionNegotiator::new(consent.clone()).await);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.check_or_request().await })
        };
        consent.prompted.notified().await;
        request.abort();
        let _ = request.await;

        assert!(!negotiator.is_negotiating());
        assert!(!negotiator.on_consent_result(true));
    }

    #[tokio::test]
    async fn test_recheck_drops_withdrawn_grant() {
        let consent = Arc::new(ScriptedConsent::default());
        consent.granted.store(true, Ordering::SeqCst);
        let negotiator = PermissionNegotiator::new(consent.clone()).await;

        negotiator.recheck_consent().await;
        assert_eq!(negotiator.status(), PermissionStatus::Granted);

        consent.granted.store(false, Ordering::SeqCst);
        negotiator.recheck_consent().await;
        assert_eq!(negotiator.status(), PermissionStatus::Pending);
    }
}
