//! The host embedding interface.
//!
//! A [`Runtime`] owns the shared heap and the module provider. Hosts load
//! object bytes into a [`ProgramHandle`], then invoke its exported
//! functions, either on the calling thread ([`Runtime::invoke`]) or on a
//! thread of their own ([`Runtime::spawn`]). Traps come back as
//! [`Outcome::Trapped`], never as panics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::error::{InvokeError, LoadError, Trap};
use crate::heap::{HeapStats, HostValue, SharedHeap};
use crate::interp::{CancelToken, Interpreter};
use crate::link::{resolve, MemoryProvider, ObjectProvider, Program};
use crate::object::{decode, validate::validate, ObjectFile};

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(HostValue),
    Trapped(Trap),
}

impl Outcome {
    pub fn is_returned(&self) -> bool {
        matches!(self, Outcome::Returned(_))
    }

    pub fn into_result(self) -> Result<HostValue, Trap> {
        match self {
            Outcome::Returned(value) => Ok(value),
            Outcome::Trapped(trap) => Err(trap),
        }
    }
}

/// A loaded, linked program. Cheap to clone; clones share the program and
/// its cancellation state.
#[derive(Debug, Clone)]
pub struct ProgramHandle {
    program: Arc<Program>,
    cancel: CancelToken,
}

impl ProgramHandle {
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn module_name(&self) -> &str {
        self.program.root().module_name()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An invocation running on its own thread.
pub struct Invocation {
    cancel: CancelToken,
    result: channel::Receiver<Outcome>,
    thread: JoinHandle<()>,
}

impl Invocation {
    /// Ask this invocation, and no other, to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the invocation to end.
    pub fn join(self) -> Result<Outcome, InvokeError> {
        let outcome = self.result.recv();
        self.thread.join().map_err(|_| InvokeError::Panicked)?;
        outcome.map_err(|_| InvokeError::Panicked)
    }
}

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);

pub struct Runtime {
    config: RuntimeConfig,
    heap: Arc<SharedHeap>,
    provider: Arc<dyn ObjectProvider>,
}

impl Runtime {
    /// A runtime whose programs must be self-contained.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_provider(config, MemoryProvider::new())
    }

    /// A runtime that resolves imports through `provider`.
    pub fn with_provider(config: RuntimeConfig, provider: impl ObjectProvider + 'static) -> Self {
        Self {
            heap: SharedHeap::new(config.gc_threshold),
            config,
            provider: Arc::new(provider),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Decode, resolve and link an object. Nothing runs unless all three
    /// succeed, including the link-time arity checks.
    pub fn load(&self, bytes: &[u8]) -> Result<ProgramHandle, LoadError> {
        let object = decode(bytes)?;
        self.load_object(object)
    }

    /// Resolve and link an object that is already in memory.
    pub fn load_object(&self, object: ObjectFile) -> Result<ProgramHandle, LoadError> {
        let set = resolve(Arc::new(object), self.provider.as_ref())?;
        for object in &set.objects {
            validate(object)?;
        }
        let program = Program::link(set);
        program.verify()?;
        info!(
            module = program.root().module_name(),
            objects = program.objects().len(),
            "program loaded"
        );
        Ok(ProgramHandle {
            program: Arc::new(program),
            cancel: CancelToken::new(),
        })
    }

    fn interpreter(&self, handle: &ProgramHandle, cancel: CancelToken) -> Interpreter {
        Interpreter::new(
            Arc::clone(&handle.program),
            &self.heap,
            self.config.clone(),
            cancel,
        )
    }

    /// Run an exported function of the program's root object to completion
    /// on the calling thread.
    pub fn invoke(
        &self,
        handle: &ProgramHandle,
        entry: &str,
        args: &[HostValue],
    ) -> Result<Outcome, InvokeError> {
        let key = handle.program.entry(entry)?;
        let mut interp = self.interpreter(handle, handle.cancel.child());
        interp.start(key, args)?;
        Ok(finish(&mut interp))
    }

    /// Start an exported function on a new thread with its own call stack.
    /// Argument and entry errors are reported before the thread starts.
    pub fn spawn(
        &self,
        handle: &ProgramHandle,
        entry: &str,
        args: &[HostValue],
    ) -> Result<Invocation, InvokeError> {
        let key = handle.program.entry(entry)?;
        let cancel = handle.cancel.child();
        let mut interp = self.interpreter(handle, cancel.clone());
        interp.start(key, args)?;

        let (tx, rx) = channel::bounded(1);
        let name = format!("vellum-invoke-{}", NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
        debug!(thread = %name, entry, "spawning invocation");
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let outcome = finish(&mut interp);
                // Release the heap before reporting, so a joined invocation
                // never holds up a collection.
                drop(interp);
                let _ = tx.send(outcome);
            })
            .map_err(|e| InvokeError::Spawn(e.to_string()))?;

        Ok(Invocation {
            cancel,
            result: rx,
            thread,
        })
    }

    /// Stop every running and future invocation of `handle`.
    pub fn cancel(&self, handle: &ProgramHandle) {
        info!(module = handle.module_name(), "cancelling program");
        handle.cancel.cancel();
    }

    /// Collect now. Waits for running invocations to reach a safepoint.
    pub fn collect_garbage(&self) -> usize {
        self.heap.collect_detached(Vec::new()).unwrap_or(0)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }
}

/// Run to the end and copy the result out while still attached.
fn finish(interp: &mut Interpreter) -> Outcome {
    match interp.run().and_then(|value| interp.to_host(value)) {
        Ok(value) => Outcome::Returned(value),
        Err(trap) => Outcome::Trapped(trap),
    }
}
