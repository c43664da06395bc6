use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use events::StackFrame;
use log::{debug, info, warn};

use super::runtime::*;
use crate::{
    capture::Value,
    core::code::{basename, CodeRegistry, CompiledUnit},
    error::{Error, Result},
};

/// Location a hook is attached to.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum HookTarget {
    Method {
        type_name: String,
        method_name: String,
    },
    /// Line of a file, the file being identified by its basename.
    Line { file: String, line: u32 },
}

impl HookTarget {
    pub fn method<T: Into<String>, M: Into<String>>(type_name: T, method_name: M) -> Self {
        Self::Method {
            type_name: type_name.into(),
            method_name: method_name.into(),
        }
    }

    pub fn line<F: AsRef<str>>(file: F, line: u32) -> Self {
        Self::Line {
            file: basename(file.as_ref()).to_string(),
            line,
        }
    }
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Method {
                type_name,
                method_name,
            } => write!(f, "{type_name}.{method_name}"),
            Self::Line { file, line } => write!(f, "{file}:{line}"),
        }
    }
}

/// Data given to method hook callbacks, once the original method returned.
pub struct MethodHit<'a> {
    pub args: &'a CallArgs,
    /// Value returned by the original method, handed back to the caller
    /// untouched.
    pub return_value: &'a Value,
    /// Time spent in the original method.
    pub duration: Duration,
    pub call_stack: Vec<StackFrame>,
}

pub type MethodCallback = Arc<dyn Fn(&MethodHit<'_>) + Send + Sync>;

/// Notified when a pending hook gets installed.
pub trait InstallObserver: Send + Sync {
    fn hook_installed(&self, target: &HookTarget);
}

type MethodKey = (String, String);
type LineKey = (String, u32);

struct InstalledMethod {
    /// Instrumentation id of this installation.
    id: u64,
    handle: MethodHandle,
}

/// Bookkeeping of all hooks, guarded by a single lock.
#[derive(Default)]
struct Registry {
    pending_methods: HashMap<MethodKey, MethodCallback>,
    pending_lines: HashMap<LineKey, LineCallback>,
    instrumented_methods: HashMap<MethodKey, InstalledMethod>,
    /// Current instrumentation id per method, read by the method wrappers
    /// when they fire. Kept across re-installations; 0 means disabled.
    method_slots: HashMap<MethodKey, Arc<AtomicU64>>,
    instrumented_lines: HashMap<LineKey, LineHandle>,
}

/// Installs, tracks and removes hooks.
///
/// Hooks whose target does not exist yet are kept pending and installed when
/// the host reports the target (a type definition or a compiled unit).
/// Registrations only change under the registry lock; firing hooks never
/// take it.
pub struct HookManager {
    runtime: Arc<dyn HostRuntime>,
    code_registry: Option<Arc<CodeRegistry>>,
    /// Allow untargeted line tracing.
    untargeted: bool,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    closed: AtomicBool,
    definitions: Mutex<Option<SubscriptionId>>,
    install_observer: Mutex<Option<Weak<dyn InstallObserver>>>,
}

impl HookManager {
    pub fn new(
        runtime: Arc<dyn HostRuntime>,
        code_registry: Option<Arc<CodeRegistry>>,
        untargeted: bool,
    ) -> Self {
        Self {
            runtime,
            code_registry,
            untargeted,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            definitions: Mutex::new(None),
            install_observer: Mutex::new(None),
        }
    }

    /// Start receiving the events needed to install pending hooks: type
    /// definitions from the host and new units from the code registry.
    pub fn subscribe(self: &Arc<Self>) {
        let mut definitions = self.definitions.lock().unwrap();
        if definitions.is_none() {
            let observer: Weak<dyn DefinitionObserver> = Arc::downgrade(self) as Weak<HookManager>;
            *definitions = Some(self.runtime.subscribe_definitions(observer));
        }
        drop(definitions);

        if let Some(registry) = &self.code_registry {
            let listener: Weak<dyn CompileObserver> = Arc::downgrade(self) as Weak<HookManager>;
            registry.add_listener(listener);
        }
    }

    pub fn set_install_observer(&self, observer: Weak<dyn InstallObserver>) {
        *self.install_observer.lock().unwrap() = Some(observer);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn notify_installed(&self, targets: &[HookTarget]) {
        if targets.is_empty() {
            return;
        }
        let observer = self
            .install_observer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(observer) = observer {
            targets.iter().for_each(|t| observer.hook_installed(t));
        }
    }

    /// Hook a method. The callback is invoked after each call of the method,
    /// on the calling thread.
    pub fn hook_method(&self, type_name: &str, method_name: &str, cb: MethodCallback) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();
        self.hook_method_locked(&mut registry, type_name, method_name, cb)
    }

    /// Same as `hook_method`, but a not yet defined target is not an error:
    /// the hook is stored as pending and installed once the type shows up.
    /// Returns whether the hook was installed right away.
    pub fn hook_method_when_defined(
        &self,
        type_name: &str,
        method_name: &str,
        cb: MethodCallback,
    ) -> Result<bool> {
        let mut registry = self.registry.lock().unwrap();
        match self.hook_method_locked(&mut registry, type_name, method_name, cb.clone()) {
            Ok(()) => Ok(true),
            Err(Error::TargetNotDefined(what)) => {
                debug!("{what} not defined yet, hooking {type_name}.{method_name} later");
                registry
                    .pending_methods
                    .insert((type_name.to_string(), method_name.to_string()), cb);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn hook_method_locked(
        &self,
        registry: &mut Registry,
        type_name: &str,
        method_name: &str,
        cb: MethodCallback,
    ) -> Result<()> {
        let key = (type_name.to_string(), method_name.to_string());

        // Never stack interceptors on a method.
        if let Some(previous) = registry.instrumented_methods.remove(&key) {
            if let Some(slot) = registry.method_slots.get(&key) {
                slot.store(0, Ordering::Release);
            }
            if let Err(e) = self.runtime.remove_method_interceptor(&previous.handle) {
                warn!("Could not remove previous hook on {type_name}.{method_name}: {e}");
            }
        }

        let id = self.next_id();
        let slot = Arc::clone(
            registry
                .method_slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        );

        let dispatch_slot = Arc::clone(&slot);
        let wrap: MethodWrapper = Box::new(move |saved: MethodBody| -> MethodBody {
            Arc::new(move |inv: &Invocation<'_>| {
                if dispatch_slot.load(Ordering::Acquire) != id {
                    return saved(inv);
                }

                let start = Instant::now();
                let rv = saved(inv);
                let duration = start.elapsed();
                cb(&MethodHit {
                    args: inv.args,
                    return_value: &rv,
                    duration,
                    call_stack: inv.call_stack(),
                });
                rv
            })
        });

        let handle = self
            .runtime
            .install_method_interceptor(type_name, method_name, wrap)?;
        slot.store(id, Ordering::Release);
        registry
            .instrumented_methods
            .insert(key, InstalledMethod { id, handle });

        debug!("Hooked {type_name}.{method_name} (id {id})");
        Ok(())
    }

    /// Hook a line of a file. Files are matched by basename.
    pub fn hook_line(&self, file: &str, line: u32, cb: LineCallback) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();
        self.hook_line_locked(&mut registry, file, line, cb)
    }

    /// Same as `hook_line`, but an unknown file is not an error: the hook is
    /// stored as pending and installed once the file is loaded. Returns
    /// whether the hook was installed right away.
    pub fn hook_line_when_defined(&self, file: &str, line: u32, cb: LineCallback) -> Result<bool> {
        let mut registry = self.registry.lock().unwrap();
        match self.hook_line_locked(&mut registry, file, line, cb.clone()) {
            Ok(()) => Ok(true),
            Err(Error::TargetNotDefined(what)) => {
                debug!("{what}, hooking {file}:{line} later");
                registry
                    .pending_lines
                    .insert((basename(file).to_string(), line), cb);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn hook_line_locked(
        &self,
        registry: &mut Registry,
        file: &str,
        line: u32,
        cb: LineCallback,
    ) -> Result<()> {
        let file = basename(file);

        let unit: Option<Arc<CompiledUnit>> = match &self.code_registry {
            Some(code) if code.is_active() => match code.lookup(file) {
                Some(unit) => Some(unit),
                None if self.untargeted => None,
                None => {
                    return Err(Error::TargetNotDefined(format!(
                        "File {file} not in code registry"
                    )))
                }
            },
            _ if self.untargeted => None,
            _ => {
                return Err(Error::UntargetedTracingDisallowed(format!("{file}:{line}")));
            }
        };

        let key = (file.to_string(), line);

        // Disable the previous hook before installing the new one.
        if let Some(previous) = registry.instrumented_lines.remove(&key) {
            self.runtime.remove_line_interceptor(previous)?;
        }

        let target_file = file.to_string();
        let callback: LineCallback = Arc::new(move |event: &LineEvent<'_>| {
            if event.line == line && basename(event.path) == target_file {
                cb(event);
            }
        });

        let handle = self
            .runtime
            .install_line_interceptor(unit.as_deref(), file, line, callback)?;
        registry.instrumented_lines.insert(key, handle);

        match unit {
            Some(unit) => debug!("Hooked {file}:{line} (unit {})", unit.id()),
            None => info!("Hooked {file}:{line} using untargeted tracing"),
        }
        Ok(())
    }

    /// Retry the pending line hooks of a file.
    pub fn install_pending_line_hooks(&self, path: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let file = basename(path);
        let mut installed = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            let candidates: Vec<(LineKey, LineCallback)> = registry
                .pending_lines
                .iter()
                .filter(|((f, _), _)| f == file)
                .map(|(k, cb)| (k.clone(), Arc::clone(cb)))
                .collect();

            for ((f, line), cb) in candidates {
                match self.hook_line_locked(&mut registry, &f, line, cb) {
                    Ok(()) => {
                        registry.pending_lines.remove(&(f.clone(), line));
                        installed.push(HookTarget::Line { file: f, line });
                    }
                    Err(Error::TargetNotDefined(_)) => (),
                    Err(e) => warn!("Could not install pending hook on {f}:{line}: {e}"),
                }
            }
        }

        self.notify_installed(&installed);
    }

    /// Retry the pending method hooks of a type.
    fn install_pending_method_hooks(&self, type_name: &str) {
        let mut installed = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            let candidates: Vec<(MethodKey, MethodCallback)> = registry
                .pending_methods
                .iter()
                .filter(|((t, _), _)| t == type_name)
                .map(|(k, cb)| (k.clone(), Arc::clone(cb)))
                .collect();

            for ((t, m), cb) in candidates {
                match self.hook_method_locked(&mut registry, &t, &m, cb) {
                    Ok(()) => {
                        registry.pending_methods.remove(&(t.clone(), m.clone()));
                        installed.push(HookTarget::Method {
                            type_name: t,
                            method_name: m,
                        });
                    }
                    Err(Error::TargetNotDefined(_)) => (),
                    Err(e) => warn!("Could not install pending hook on {t}.{m}: {e}"),
                }
            }
        }

        self.notify_installed(&installed);
    }

    /// Remove an installed hook. Nothing is done if the target isn't hooked.
    /// On error the hook stays registered and removal can be retried.
    pub fn unhook(&self, target: &HookTarget) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();
        match target {
            HookTarget::Method {
                type_name,
                method_name,
            } => {
                let key = (type_name.clone(), method_name.clone());
                let Some(installed) = registry.instrumented_methods.get(&key) else {
                    return Ok(());
                };
                self.runtime.remove_method_interceptor(&installed.handle)?;

                let id = installed.id;
                if let Some(slot) = registry.method_slots.get(&key) {
                    // Only disable dispatch if no other installation took over.
                    let _ = slot.compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire);
                }
                registry.instrumented_methods.remove(&key);
            }
            HookTarget::Line { file, line } => {
                let key = (file.clone(), *line);
                let Some(handle) = registry.instrumented_lines.get(&key).cloned() else {
                    return Ok(());
                };
                self.runtime.remove_line_interceptor(handle)?;
                registry.instrumented_lines.remove(&key);
            }
        }

        debug!("Unhooked {target}");
        Ok(())
    }

    /// Forget a pending hook. Returns whether one was pending.
    pub fn clear_pending(&self, target: &HookTarget) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match target {
            HookTarget::Method {
                type_name,
                method_name,
            } => registry
                .pending_methods
                .remove(&(type_name.clone(), method_name.clone()))
                .is_some(),
            HookTarget::Line { file, line } => registry
                .pending_lines
                .remove(&(file.clone(), *line))
                .is_some(),
        }
    }

    pub fn is_installed(&self, target: &HookTarget) -> bool {
        let registry = self.registry.lock().unwrap();
        match target {
            HookTarget::Method {
                type_name,
                method_name,
            } => registry
                .instrumented_methods
                .contains_key(&(type_name.clone(), method_name.clone())),
            HookTarget::Line { file, line } => registry
                .instrumented_lines
                .contains_key(&(file.clone(), *line)),
        }
    }

    pub fn is_pending(&self, target: &HookTarget) -> bool {
        let registry = self.registry.lock().unwrap();
        match target {
            HookTarget::Method {
                type_name,
                method_name,
            } => registry
                .pending_methods
                .contains_key(&(type_name.clone(), method_name.clone())),
            HookTarget::Line { file, line } => registry
                .pending_lines
                .contains_key(&(file.clone(), *line)),
        }
    }

    /// Number of installed and pending hooks.
    pub fn counts(&self) -> (usize, usize) {
        let registry = self.registry.lock().unwrap();
        (
            registry.instrumented_methods.len() + registry.instrumented_lines.len(),
            registry.pending_methods.len() + registry.pending_lines.len(),
        )
    }

    /// Disable and remove all installed hooks. Pending hooks are kept.
    pub fn clear_hooks(&self) {
        let mut registry = self.registry.lock().unwrap();

        registry
            .method_slots
            .values()
            .for_each(|slot| slot.store(0, Ordering::Release));
        let methods: Vec<_> = registry.instrumented_methods.drain().collect();
        for ((t, m), installed) in methods {
            if let Err(e) = self.runtime.remove_method_interceptor(&installed.handle) {
                warn!("Could not remove hook on {t}.{m}: {e}");
            }
        }

        let lines: Vec<_> = registry.instrumented_lines.drain().collect();
        for ((f, l), handle) in lines {
            if let Err(e) = self.runtime.remove_line_interceptor(handle) {
                warn!("Could not remove hook on {f}:{l}: {e}");
            }
        }
    }

    /// Stop following definitions, remove all hooks and forget pending ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(id) = self.definitions.lock().unwrap().take() {
            self.runtime.unsubscribe_definitions(id);
        }

        self.clear_hooks();

        let mut registry = self.registry.lock().unwrap();
        registry.pending_methods.clear();
        registry.pending_lines.clear();
    }
}

impl DefinitionObserver for HookManager {
    fn type_defined(&self, type_name: &str) {
        if !self.closed.load(Ordering::Acquire) {
            self.install_pending_method_hooks(type_name);
        }
    }
}

impl CompileObserver for HookManager {
    fn unit_compiled(&self, unit: &CompiledUnit) {
        self.install_pending_line_hooks(unit.path());
    }
}
