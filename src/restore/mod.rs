//! Endpoint restoration after an agent restart.
//!
//! # Restore Flow
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Startup Restore Flow                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ 1. Partition candidate directories                                │
//! │    └─ Staged/failed update leftovers are deleted                  │
//! │                                                                   │
//! │ 2. For each complete directory:                                   │
//! │    ├─ Load snapshot bytes (JSON file, legacy header fallback)     │
//! │    ├─ Rebuild the runtime endpoint                                │
//! │    └─ Publish the host endpoint id                                │
//! │                                                                   │
//! │ 3. Per endpoint, concurrently (driver):                           │
//! │    ├─ Recover the host ifindex                                    │
//! │    ├─ Re-allocate the security identity                           │
//! │    ├─ Refresh orchestrator metadata                               │
//! │    └─ Regenerate the datapath                                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A writer persists an endpoint by staging the new state in a
//! `<id>_next` directory and atomically renaming it over `<id>`; a failed
//! build is parked at `<id>_next_fail`. Finding a suffixed directory next to
//! its unsuffixed sibling therefore always identifies a crash leftover that
//! is safe to discard. A suffixed directory without a sibling is the only
//! copy and is read in place.

pub mod driver;

pub use driver::{RestoreDriver, RestoreStats};

use crate::endpoint::{Endpoint, ParseContext};
use crate::error::{Error, ParseError, Result};
use crate::node::HostEndpointRegistry;
use crate::types::EndpointId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Primary per-endpoint state file.
pub const STATE_FILE_NAME: &str = "endpoint_state.json";

/// Legacy header file that embeds the snapshot as a base64 line.
pub const LEGACY_HEADER_FILE_NAME: &str = "endpoint_config.h";

/// Marker prefix of the snapshot line within the legacy header file.
pub const LEGACY_STATE_PREFIX: &str = "NETWARDEN_BASE64";

/// Suffix of a directory holding a staged, not yet promoted update.
pub const NEXT_DIR_SUFFIX: &str = "_next";

/// Suffix of a directory whose staged update failed to build.
pub const NEXT_FAIL_DIR_SUFFIX: &str = "_next_fail";

/// Partition candidate directory names into those holding a complete
/// endpoint restore and those left over from an interrupted update.
///
/// A name is incomplete iff it carries a staging suffix *and* the name with
/// the suffix stripped is also present: the unsuffixed sibling is then the
/// authoritative copy. A suffixed name without a sibling is itself complete.
/// Input order is preserved in both outputs.
pub fn partition_restore_dirs(dir_names: &[String]) -> (Vec<String>, Vec<String>) {
    let names: HashSet<&str> = dir_names.iter().map(String::as_str).collect();

    let mut incomplete_set: HashSet<&str> = HashSet::new();
    for name in dir_names {
        for suffix in [NEXT_DIR_SUFFIX, NEXT_FAIL_DIR_SUFFIX] {
            if let Some(stripped) = name.strip_suffix(suffix) {
                if names.contains(stripped) {
                    incomplete_set.insert(name.as_str());
                }
            }
        }
    }

    let mut complete = Vec::new();
    let mut incomplete = Vec::new();
    for name in dir_names {
        if incomplete_set.contains(name.as_str()) {
            incomplete.push(name.clone());
        } else {
            complete.push(name.clone());
        }
    }
    (complete, incomplete)
}

/// Best-effort removal of incomplete restore directories. Failures are
/// logged and skipped; stale directories never block the restore pass.
pub fn cleanup_incomplete_dirs(base: &Path, incomplete: &[String]) {
    for dir_name in incomplete {
        let full = base.join(dir_name);
        info!(
            endpoint_dir = %dir_name,
            path = %full.display(),
            "Found incomplete restore directory. Removing it"
        );
        if let Err(e) = fs::remove_dir_all(&full) {
            warn!(
                endpoint_dir = %dir_name,
                path = %full.display(),
                error = %e,
                "Error while removing directory. Ignoring it"
            );
        }
    }
}

/// Load the raw snapshot bytes from a directory believed complete.
///
/// Prefers the JSON state file and falls back to scanning the legacy header
/// file for a `PREFIX:<base64>` line. Reaching the end of the header without
/// a match reports [`Error::StateNotFound`].
pub fn find_endpoint_state(dir: &Path) -> Result<Bytes> {
    match fs::read(dir.join(STATE_FILE_NAME)) {
        Ok(bytes) => {
            debug!(path = %dir.display(), "Restoring from JSON state file");
            return Ok(Bytes::from(bytes));
        }
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    let file = match File::open(dir.join(LEGACY_HEADER_FILE_NAME)) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::StateNotFound),
        Err(e) => return Err(e.into()),
    };

    debug!(path = %dir.display(), "Restoring from legacy header file");

    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        if !line.contains(LEGACY_STATE_PREFIX) {
            continue;
        }
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 2 {
            return Err(ParseError::InvalidLegacyLine { line }.into());
        }
        let decoded = BASE64
            .decode(parts[1].trim())
            .map_err(ParseError::Base64)?;
        return Ok(Bytes::from(decoded));
    }

    Err(Error::StateNotFound)
}

/// Rebuilds runtime endpoints from the on-disk state directory.
pub struct RestoreManager {
    base_dir: PathBuf,
    parse_ctx: ParseContext,
    host_registry: Arc<HostEndpointRegistry>,
}

impl RestoreManager {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        parse_ctx: ParseContext,
        host_registry: Arc<HostEndpointRegistry>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            parse_ctx,
            host_registry,
        }
    }

    /// Names of the sub-directories of the state directory, in directory
    /// order. A missing state directory yields an empty list.
    pub fn scan_state_dir(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Resolve a list of candidate directory names to runtime endpoints.
    ///
    /// Incomplete directories are removed from storage. Directories whose
    /// state is missing or malformed are logged and skipped; one endpoint's
    /// failure never aborts the batch. When two directories resolve to the
    /// same endpoint id, the directory matching the endpoint's canonical
    /// path wins, otherwise the first one encountered. The host endpoint's
    /// id is published before returning.
    pub fn read_endpoints_from_dirs(
        &self,
        dir_names: &[String],
    ) -> HashMap<EndpointId, Arc<Endpoint>> {
        let (complete, incomplete) = partition_restore_dirs(dir_names);
        cleanup_incomplete_dirs(&self.base_dir, &incomplete);

        let mut possible: HashMap<EndpointId, Arc<Endpoint>> = HashMap::new();
        for dir_name in &complete {
            let dir = self.base_dir.join(dir_name);

            let state = match find_endpoint_state(&dir) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        endpoint_dir = %dir_name,
                        path = %dir.display(),
                        error = %e,
                        "Couldn't find state, ignoring endpoint"
                    );
                    continue;
                }
            };

            let ep = match Endpoint::parse(&state, &self.parse_ctx) {
                Ok(ep) => Arc::new(ep),
                Err(e) => {
                    warn!(
                        endpoint_dir = %dir_name,
                        path = %dir.display(),
                        error = %e,
                        "Unable to parse restored endpoint state"
                    );
                    continue;
                }
            };

            match possible.entry(ep.id()) {
                Entry::Occupied(mut entry) => {
                    // Duplicate id across a pending-update race: prefer the
                    // directory that matches the endpoint's canonical path.
                    if ep.directory_path(&self.base_dir).ends_with(dir_name) {
                        entry.insert(ep.clone());
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(ep.clone());
                }
            }

            // Other endpoints need the host endpoint id to regenerate.
            if ep.is_host() {
                self.host_registry.publish(ep.id());
            }
        }

        possible
    }
}
