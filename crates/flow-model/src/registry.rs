// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver registry: static metadata for every constructible model provider.
//!
//! This module is the single source of truth for which provider ids
//! [`crate::from_config`] can build. Concrete vendor wire protocols are out of
//! scope for this crate; the registry lists only the deterministic reference
//! drivers used for hermetic testing (`mock`, `replay`).

/// Metadata describing a registered model driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique provider id used in `model.provider` config field (e.g. `"mock"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line description shown by `flow list-providers`.
    pub description: &'static str,
    /// Default environment variable that holds an API key, if any.
    pub default_api_key_env: Option<&'static str>,
}

/// Complete registry of constructible drivers.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "mock",
        name: "Mock",
        description: "Deterministic echo provider; set FLOW_MOCK_RESPONSES or \
            model.mock_responses_file to replay a scripted ResponseEvent sequence",
        default_api_key_env: None,
    },
];

/// Look up driver metadata by id.
pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// All driver ids, in registration order.
pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}

/// All driver metadata, in registration order.
pub fn list_drivers() -> impl Iterator<Item = &'static DriverMeta> {
    DRIVERS.iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_driver_is_registered() {
        assert!(get_driver("mock").is_some());
    }

    #[test]
    fn unknown_driver_returns_none() {
        assert!(get_driver("totally-unknown").is_none());
    }

    #[test]
    fn known_driver_ids_contains_mock() {
        assert!(known_driver_ids().any(|id| id == "mock"));
    }
}
