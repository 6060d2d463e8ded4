//! Crate-wide constants.

/// Application name used for directory layout.
pub const APP_NAME: &str = "strata";

/// Version of the cache key input format. Bumping it invalidates every key.
pub const CACHE_KEY_VERSION: u32 = 1;

/// Version of the on-disk key record format.
pub const KEY_RECORD_VERSION: u32 = 1;

/// Default build file name looked up by the CLI.
pub const BUILD_FILE_NAME: &str = "strata.json";

/// Base image reference that resolves to an empty root snapshot.
pub const SCRATCH_IMAGE: &str = "scratch";

/// `PATH` given to `run` commands unless the stage sets its own.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Value of `SOURCE_DATE_EPOCH` for commands: 1980-01-01T00:00:00Z (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Mode for directories the engine creates implicitly.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Mode for files captured on platforms without unix permissions.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
