use core::time::Duration;
use idgen::IdentifierSourceService;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically tops every pool up to its low-water mark until `shutdown` is
/// cancelled. The first sweep runs immediately.
pub async fn refill_pools(
    service: IdentifierSourceService,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match service.replenish_pools().await {
            Ok(report) if report.added > 0 || !report.failures.is_empty() => {
                tracing::info!(
                    added = report.added,
                    failed = report.failures.len(),
                    "Pool sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Pool sweep failed"),
        }
    }

    tracing::debug!("Pool sweep stopped");
}
