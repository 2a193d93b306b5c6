//! Process metadata sent once, with the first captured request

use crate::routes::Routes;
use apitally_core::StartupData;
use std::collections::BTreeMap;

/// Identifies this integration to the ingesting side
pub const CLIENT_ID: &str = "rust-serverless:tower";

/// Name under which this crate's own version is reported
pub const PACKAGE_NAME: &str = env!("CARGO_PKG_NAME");

/// Version of this crate
pub const PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key of the compiler version in the startup versions
pub const RUNTIME_NAME: &str = "rust";

/// Version of the compiler this crate was built with, `unknown` if the
/// build could not determine it
pub const RUNTIME_VERSION: &str = env!("APITALLY_RUSTC_VERSION");

/// Build the startup metadata for a route catalog.
///
/// `versions` are reported next to the compiler version and this crate's
/// own version, neither of which can be overridden.
pub fn startup_data(routes: &Routes, versions: &BTreeMap<String, String>) -> StartupData {
    let mut all_versions = versions.clone();
    all_versions.insert(RUNTIME_NAME.to_string(), RUNTIME_VERSION.to_string());
    all_versions.insert(PACKAGE_NAME.to_string(), PACKAGE_VERSION.to_string());

    StartupData {
        paths: routes.endpoints(),
        versions: all_versions,
        client: CLIENT_ID.to_string(),
    }
}
