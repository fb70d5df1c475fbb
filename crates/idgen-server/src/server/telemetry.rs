//! Console logging.
//!
//! Events from the service, the `idgen` library and `tower-http` request
//! spans are written through a `tracing_subscriber::fmt` layer. Verbosity is
//! controlled with `RUST_LOG` and defaults to `info`, e.g.
//!
//! ```bash
//! RUST_LOG=idgen=debug,tower_http=debug cargo run --bin idgen-server
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .try_init()?;
    Ok(())
}
