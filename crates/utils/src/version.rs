use std::sync::LazyLock;

/// Defines the application version reported by the `/version` endpoint.
pub static VERSION: LazyLock<String> =
    LazyLock::new(|| format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("BUILD_COMMIT")));
