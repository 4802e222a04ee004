//! Legacy Name-Based Classification
//!
//! Before descriptors carried explicit metadata, connection classes and
//! endpoints were inferred from request labels. The inference survives here
//! for compatibility checking only: [`verify_catalog`] runs at startup and
//! asserts that every shipped feed kind classifies identically under both
//! paths, so a drifting label can never silently change routing.
//!
//! New feed kinds must declare explicit metadata on [`FeedKind`]; nothing
//! outside this module may call the inference functions for routing.

use super::{ConnectionClass, Endpoints, FeedKind};

/// Infer a connection class from a request label.
///
/// Labels mentioning a user, order, or notification group per principal;
/// order books and explorer feeds isolate; everything else shares.
#[must_use]
pub fn infer_connection_class(label: &str) -> ConnectionClass {
    let lowered = label.to_lowercase();

    if lowered.contains("user") || lowered.contains("order") || lowered.contains("notification") {
        ConnectionClass::UserGrouped
    } else if lowered.contains("book") || lowered.contains("explorer") {
        ConnectionClass::Dedicated
    } else {
        ConnectionClass::Shared
    }
}

/// Infer the target URL from a request label.
#[must_use]
pub fn infer_url(label: &str, endpoints: &Endpoints) -> String {
    if label.to_lowercase().contains("explorer") {
        endpoints.explorer.clone()
    } else {
        endpoints.api.clone()
    }
}

/// Mismatch between explicit metadata and the legacy inference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("feed {label}: explicit metadata says {explicit}, legacy inference says {inferred}")]
pub struct CatalogMismatch {
    /// Wire label of the disagreeing feed.
    pub label: &'static str,
    /// Class from explicit metadata.
    pub explicit: &'static str,
    /// Class from legacy inference.
    pub inferred: &'static str,
}

/// Assert that explicit metadata and legacy inference agree for every
/// shipped feed kind.
///
/// # Errors
///
/// Returns the first [`CatalogMismatch`] found.
pub fn verify_catalog(endpoints: &Endpoints) -> Result<(), CatalogMismatch> {
    for kind in FeedKind::all() {
        let label = kind.request_label();
        let explicit = kind.connection_class();
        let inferred = infer_connection_class(label);

        if explicit != inferred {
            return Err(CatalogMismatch {
                label,
                explicit: explicit.as_str(),
                inferred: inferred.as_str(),
            });
        }

        if kind.resolve_url(endpoints) != infer_url(label, endpoints) {
            return Err(CatalogMismatch {
                label,
                explicit: "explicit url",
                inferred: "inferred url",
            });
        }
    }

    Ok(())
}
