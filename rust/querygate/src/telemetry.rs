use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

/// Used when `RUST_LOG` is unset. Request spans come from `tower_http`.
pub const DEFAULT_FILTER: &str = "info,querygate=info,tower_http=info";

static INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    init_with_default(DEFAULT_FILTER);
}

/// Installs the global subscriber once. Later calls, or a subscriber installed
/// elsewhere, leave the existing one in place.
pub fn init_with_default(default_directives: &str) {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives));
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    });
}
