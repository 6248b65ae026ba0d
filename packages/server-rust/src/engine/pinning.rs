//! Default engine: records the revisions a package manifest asks for.
//!
//! A package directory carries a JSON manifest listing its dependencies.
//! Resolving compares the manifest with the pins file written by the
//! previous resolution, reports every difference as workspace events, and
//! rewrites the pins. Nothing is fetched; a resolver that talks to real
//! repositories plugs in through [`EngineFactory`].

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use pkgsvc_core::ResourceKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EngineContext, EngineError, EngineFactory, PackageEngine, ResolveReason, WorkspaceEvent};

/// Current pins file format version.
const RESOLVED_VERSION: u32 = 1;

/// File names the engine looks for inside a package directory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub manifest_file: String,
    pub resolved_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manifest_file: "pkgsvc.json".to_string(),
            resolved_file: "pkgsvc.resolved".to_string(),
        }
    }
}

/// A dependency as declared in the manifest and as recorded in the pins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub url: String,
    pub revision: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    dependencies: Vec<Dependency>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResolvedFile {
    version: u32,
    pins: Vec<Dependency>,
}

enum PinChange<'a> {
    Added(&'a Dependency),
    Updated(&'a Dependency),
    Removed(&'a Dependency),
}

impl PinChange<'_> {
    fn name(&self) -> &str {
        match self {
            Self::Added(dep) | Self::Updated(dep) | Self::Removed(dep) => &dep.name,
        }
    }
}

/// Opens [`PinningEngine`]s for package directories.
#[derive(Debug, Clone, Default)]
pub struct PinningEngineFactory {
    config: EngineConfig,
}

impl PinningEngineFactory {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for PinningEngineFactory {
    fn open(&self, key: &ResourceKey) -> Result<Box<dyn PackageEngine>, EngineError> {
        let root = key.as_path();
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(EngineError::construction(key, "not a directory")),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::construction(key, "package path does not exist"));
            }
            Err(e) => return Err(EngineError::construction(key, e.to_string())),
        }

        let manifest_path = root.join(&self.config.manifest_file);
        if !manifest_path.is_file() {
            return Err(EngineError::construction(
                key,
                format!("no manifest found at {}", manifest_path.display()),
            ));
        }

        debug!(package = %key, "opened package engine");
        Ok(Box::new(PinningEngine {
            manifest_path,
            resolved_path: root.join(&self.config.resolved_file),
        }))
    }
}

/// Engine for a single package directory.
#[derive(Debug)]
pub struct PinningEngine {
    manifest_path: PathBuf,
    resolved_path: PathBuf,
}

impl PinningEngine {
    fn load_manifest(&self) -> anyhow::Result<Manifest> {
        let raw = fs::read(&self.manifest_path)
            .with_context(|| format!("failed to read {}", self.manifest_path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("invalid manifest {}", self.manifest_path.display()))
    }

    fn load_pins(&self) -> anyhow::Result<Option<Vec<Dependency>>> {
        let raw = match fs::read(&self.resolved_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.resolved_path.display()))
            }
        };
        let resolved: ResolvedFile = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid pins file {}", self.resolved_path.display()))?;
        anyhow::ensure!(
            resolved.version == RESOLVED_VERSION,
            "unsupported pins file version {} in {}",
            resolved.version,
            self.resolved_path.display()
        );
        Ok(Some(resolved.pins))
    }

    fn store_pins(&self, pins: &[Dependency]) -> anyhow::Result<()> {
        let resolved = ResolvedFile {
            version: RESOLVED_VERSION,
            pins: pins.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&resolved)?;
        write_atomic(&self.resolved_path, &json)
    }
}

impl PackageEngine for PinningEngine {
    fn resolve(&mut self, ctx: &EngineContext<'_>) -> Result<(), EngineError> {
        let manifest = self.load_manifest()?;
        let pins = self.load_pins()?;
        let changes = diff_pins(&manifest.dependencies, pins.as_deref().unwrap_or_default());

        let reason = match (&pins, changes.is_empty()) {
            (None, _) => ResolveReason::MissingPins,
            (Some(_), false) => ResolveReason::RequirementsChanged(
                changes.iter().map(|c| c.name().to_string()).collect(),
            ),
            (Some(_), true) => ResolveReason::Verification,
        };
        ctx.emit(&WorkspaceEvent::WillResolveDependencies { reason });

        for change in &changes {
            ctx.check_terminated()?;
            match change {
                PinChange::Added(dep) => {
                    ctx.emit(&WorkspaceEvent::Fetching {
                        repository: dep.url.clone(),
                    });
                    ctx.emit(&WorkspaceEvent::Cloning {
                        repository: dep.url.clone(),
                    });
                    ctx.emit(&WorkspaceEvent::CheckingOut {
                        repository: dep.url.clone(),
                        reference: dep.revision.clone(),
                    });
                }
                PinChange::Updated(dep) => {
                    ctx.emit(&WorkspaceEvent::Updating {
                        repository: dep.url.clone(),
                    });
                    ctx.emit(&WorkspaceEvent::CheckingOut {
                        repository: dep.url.clone(),
                        reference: dep.revision.clone(),
                    });
                }
                PinChange::Removed(pin) => {
                    ctx.emit(&WorkspaceEvent::Removing {
                        repository: pin.url.clone(),
                    });
                }
            }
        }

        if pins.is_none() || !changes.is_empty() {
            ctx.check_terminated()?;
            self.store_pins(&manifest.dependencies)?;
        }
        if changes.is_empty() {
            ctx.emit(&WorkspaceEvent::UpToDate);
        }
        Ok(())
    }
}

/// Differences between declared dependencies and recorded pins, in manifest
/// order followed by removals in pin order.
fn diff_pins<'a>(declared: &'a [Dependency], pins: &'a [Dependency]) -> Vec<PinChange<'a>> {
    let pinned: HashMap<&str, &Dependency> = pins.iter().map(|p| (p.name.as_str(), p)).collect();
    let mut changes = Vec::new();

    for dep in declared {
        match pinned.get(dep.name.as_str()) {
            None => changes.push(PinChange::Added(dep)),
            Some(pin) if *pin != dep => changes.push(PinChange::Updated(dep)),
            Some(_) => {}
        }
    }
    for pin in pins {
        if !declared.iter().any(|d| d.name == pin.name) {
            changes.push(PinChange::Removed(pin));
        }
    }
    changes
}

fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
