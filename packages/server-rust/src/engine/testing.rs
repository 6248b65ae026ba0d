//! Scripted engines for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pkgsvc_core::ResourceKey;
use tokio::sync::Notify;

use super::{EngineContext, EngineError, EngineFactory, PackageEngine};

/// Blocks a workload until the test opens it.
#[derive(Default)]
pub(crate) struct Gate {
    entered: Notify,
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a workload has reached the gate.
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn pass(&self) {
        self.entered.notify_one();
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

#[derive(Clone)]
pub(crate) enum Script {
    /// Emits the lines, then succeeds.
    Lines(Vec<String>),
    /// Emits the lines, waits at the gate, then succeeds.
    Gated(Vec<String>, Arc<Gate>),
    /// Emits one line, then fails with the reason.
    Fail(String),
    Panic,
}

pub(crate) struct ScriptedEngine {
    script: Script,
}

impl PackageEngine for ScriptedEngine {
    fn resolve(&mut self, ctx: &EngineContext<'_>) -> Result<(), EngineError> {
        match &self.script {
            Script::Lines(lines) => {
                for line in lines {
                    ctx.message(line.clone());
                }
                Ok(())
            }
            Script::Gated(lines, gate) => {
                for line in lines {
                    ctx.message(line.clone());
                }
                gate.pass();
                Ok(())
            }
            Script::Fail(reason) => {
                ctx.message("starting");
                Err(EngineError::Failed(anyhow::anyhow!(reason.clone())))
            }
            Script::Panic => panic!("scripted engine panic"),
        }
    }
}

/// Hands out [`ScriptedEngine`]s and counts how many were opened.
pub(crate) struct ScriptedFactory {
    script: Script,
    reject: Option<String>,
    opens: AtomicUsize,
}

impl ScriptedFactory {
    pub(crate) fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            reject: None,
            opens: AtomicUsize::new(0),
        })
    }

    pub(crate) fn lines(lines: &[&str]) -> Arc<Self> {
        Self::new(Script::Lines(lines.iter().map(ToString::to_string).collect()))
    }

    /// Factory whose `open` always fails with `reason`.
    pub(crate) fn rejecting(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Lines(Vec::new()),
            reject: Some(reason.to_string()),
            opens: AtomicUsize::new(0),
        })
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedFactory {
    fn open(&self, key: &ResourceKey) -> Result<Box<dyn PackageEngine>, EngineError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.reject {
            return Err(EngineError::construction(key, reason.clone()));
        }
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
        }))
    }
}
