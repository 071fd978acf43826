//! Turns host signals into session events.
use proxycore_session::SessionEvent;
use std::pin::Pin;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::Stream;
use tracing::{error, info};

/// SIGWINCH is treated as a wake from sleep and SIGUSR1 as an
/// administrative revoke of the tunnel.
pub fn platform_events() -> Pin<Box<dyn Stream<Item = SessionEvent> + Send>> {
    let stream = async_stream::stream! {
        let mut sigwake = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register signal handler for SIGWINCH: {}", e);
                return;
            }
        };
        let mut sigrevoke = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register signal handler for SIGUSR1: {}", e);
                return;
            }
        };

        info!("Monitoring for wake and revoke signals.");

        loop {
            let event = tokio::select! {
                _ = sigwake.recv() => {
                    info!("Received SIGWINCH, treating as a wake event.");
                    SessionEvent::Foreground
                }
                _ = sigrevoke.recv() => {
                    info!("Received SIGUSR1, revoking the tunnel.");
                    SessionEvent::Revoked
                }
            };
            yield event;
        }
    };

    Box::pin(stream)
}
