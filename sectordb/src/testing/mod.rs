//! Helpers shared by the unit tests.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{EngineConfig, Format};
use crate::engine::Engine;
use crate::storage::MemoryStorage;

static TRACING: Once = Once::new();

/// Install a subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "sectordb=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Tiny nodes and caps so a few dozen keys build a multi-level tree,
/// spill into blobs and grow the allocator tree.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        durable_commits: false,
        cache_capacity_bytes: EngineConfig::DEFAULT_CACHE_BYTES,
        max_leaf_bytes: 256,
        max_internal_bytes: 256,
        max_internal_children: 4,
        format: Format {
            key_inline_cap: 8,
            value_inline_cap: 16,
            alloc_leaf_bytes: 256,
        },
    }
}

/// Fresh in-memory engine with [`small_config`].
pub fn small_engine() -> (Engine, MemoryStorage) {
    init_tracing();
    let storage = MemoryStorage::new();
    let engine = Engine::open(storage.clone(), small_config()).expect("open");
    (engine, storage)
}
