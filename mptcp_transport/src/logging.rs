use tracing_subscriber::EnvFilter;

const DEV_DIRECTIVES: &str = "mptcp_transport=debug,mptcp_core=debug";
const PROD_DIRECTIVES: &str = "mptcp_transport=info,mptcp_core=warn";

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize logging for development (human-readable format).
/// Returns false if a global subscriber was already installed.
pub fn init_dev_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEV_DIRECTIVES))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

/// Initialize logging for production (JSON format)
pub fn init_prod_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_or(PROD_DIRECTIVES))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .json()
        .try_init()
        .is_ok()
}

/// Initialize logging with custom filter
pub fn init_logging_with_filter(filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        let first = init_logging_with_filter("mptcp_transport=trace");
        // whichever call won, no later one may install a second subscriber
        assert!(!init_dev_logging() || !first);
        assert!(!init_prod_logging());
    }
}
