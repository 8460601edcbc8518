//! Stable exit-code contract for CI consumers.

/// All comparisons passed (or nothing to compare).
pub const OK: i32 = 0;
/// At least one comparison failed or errored, or the build gate failed.
pub const TEST_FAILURE: i32 = 1;
/// Unusable configuration (bad YAML, unknown ecosystem, missing key).
pub const CONFIG_ERROR: i32 = 2;
/// Environment/infrastructure failure (cannot write artifacts, spawn, ...).
pub const INFRA_ERROR: i32 = 3;
