use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use events::StackFrame;
use log::trace;

use crate::{
    capture::Value,
    core::{code::CompiledUnit, hook::*},
    error::{Error, Result},
};

thread_local! {
    /// Call stack of the current thread, outermost frame first.
    static CALL_STACK: RefCell<Vec<StackFrame>> = const { RefCell::new(Vec::new()) };
}

/// Wrap a closure into a method body.
pub fn method<F>(f: F) -> MethodBody
where
    F: Fn(&Invocation<'_>) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Reads the call stack of the current thread.
struct ThreadStack;

impl StackSource for ThreadStack {
    fn call_stack(&self) -> Vec<StackFrame> {
        CALL_STACK.with(|s| s.borrow().iter().rev().cloned().collect())
    }
}

/// Pops the frame it pushed when dropped, even if the body panicked.
struct FrameGuard;

impl FrameGuard {
    fn push(frame: StackFrame) -> Self {
        CALL_STACK.with(|s| s.borrow_mut().push(frame));
        FrameGuard
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        CALL_STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

struct LineTrace {
    id: u64,
    /// Unit the trace is scoped to; `None` for untargeted traces.
    unit: Option<u64>,
    line: u32,
    callback: LineCallback,
}

#[derive(Default)]
struct Tables {
    /// Method bodies, by type and method name.
    types: HashMap<String, HashMap<String, MethodBody>>,
    /// Units loaded for each path, in load order. Reloading a file does not
    /// invalidate the units loaded before.
    units: HashMap<String, Vec<CompiledUnit>>,
    traces: Vec<LineTrace>,
}

type Observers<T> = Mutex<Vec<(SubscriptionId, Weak<T>)>>;

/// In-process host runtime.
///
/// Applications embedding the engine register their types and methods,
/// load their code units and report line executions through it; method
/// calls go through its dispatch table so they can be intercepted.
#[derive(Default)]
pub struct Runtime {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    definition_observers: Observers<dyn DefinitionObserver>,
    compile_observers: Observers<dyn CompileObserver>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Define a type with its methods, or add methods to an existing type,
    /// then report the definition.
    pub fn define_type<'a, I>(&self, type_name: &str, methods: I)
    where
        I: IntoIterator<Item = (&'a str, MethodBody)>,
    {
        {
            let mut tables = self.tables.write().unwrap();
            let entry = tables.types.entry(type_name.to_string()).or_default();
            methods.into_iter().for_each(|(name, body)| {
                entry.insert(name.to_string(), body);
            });
        }

        trace!("Type {type_name} defined");
        live_observers(&self.definition_observers)
            .iter()
            .for_each(|o| o.type_defined(type_name));
    }

    pub fn is_defined(&self, type_name: &str) -> bool {
        self.tables.read().unwrap().types.contains_key(type_name)
    }

    /// Load the code of a file, with its executable lines, and report the
    /// compiled unit.
    pub fn load_unit<I: IntoIterator<Item = u32>>(&self, path: &str, lines: I) -> CompiledUnit {
        let unit = CompiledUnit::new(self.next_id(), path, lines);
        self.tables
            .write()
            .unwrap()
            .units
            .entry(path.to_string())
            .or_default()
            .push(unit.clone());

        trace!("Unit {} loaded for {path}", unit.id());
        live_observers(&self.compile_observers)
            .iter()
            .for_each(|o| o.unit_compiled(&unit));
        unit
    }

    /// Invoke a method.
    pub fn call(&self, type_name: &str, method_name: &str, args: CallArgs) -> Result<Value> {
        let body = self
            .tables
            .read()
            .unwrap()
            .types
            .get(type_name)
            .and_then(|methods| methods.get(method_name))
            .cloned()
            .ok_or_else(|| Error::TargetNotDefined(format!("{type_name}.{method_name}")))?;

        let _frame = FrameGuard::push(StackFrame::new(
            "unknown",
            format!("{type_name}.{method_name}"),
            0,
        ));
        Ok(body(&Invocation::new(&args, &ThreadStack)))
    }

    /// Report the execution of a line. Lines not holding code in any unit
    /// loaded for `path` do not execute and are ignored.
    pub fn execute_line(&self, path: &str, line: u32, locals: &[(String, Value)]) {
        let callbacks: Vec<LineCallback> = {
            let tables = self.tables.read().unwrap();
            let Some(units) = tables.units.get(path) else {
                return;
            };
            if !units.iter().any(|u| u.is_executable(line)) {
                return;
            }
            tables
                .traces
                .iter()
                .filter(|t| match t.unit {
                    Some(id) => t.line == line && units.iter().any(|u| u.id() == id),
                    None => true,
                })
                .map(|t| Arc::clone(&t.callback))
                .collect()
        };

        // Track the current position in the innermost frame.
        let in_frame = CALL_STACK.with(|s| match s.borrow_mut().last_mut() {
            Some(frame) => {
                frame.file_name = path.to_string();
                frame.line_number = line;
                true
            }
            None => false,
        });
        let _frame = (!in_frame).then(|| FrameGuard::push(StackFrame::new(path, "<main>", line)));

        let event = LineEvent::new(path, line, locals, &ThreadStack);
        callbacks.iter().for_each(|cb| cb(&event));
    }

    /// Number of installed line traces.
    pub fn line_trace_count(&self) -> usize {
        self.tables.read().unwrap().traces.len()
    }
}

fn live_observers<T: ?Sized>(observers: &Observers<T>) -> Vec<Arc<T>> {
    let mut observers = observers.lock().unwrap();
    observers.retain(|(_, o)| o.strong_count() > 0);
    observers.iter().filter_map(|(_, o)| o.upgrade()).collect()
}

impl MethodInterceptor for Runtime {
    fn install_method_interceptor(
        &self,
        type_name: &str,
        method_name: &str,
        wrap: MethodWrapper,
    ) -> Result<MethodHandle> {
        let mut tables = self.tables.write().unwrap();
        let methods = tables
            .types
            .get_mut(type_name)
            .ok_or_else(|| Error::TargetNotDefined(format!("Type not defined: {type_name}")))?;
        let current = methods.get_mut(method_name).ok_or_else(|| {
            Error::TargetNotDefined(format!("Method not defined: {type_name}.{method_name}"))
        })?;

        let saved = Arc::clone(current);
        let installed = wrap(Arc::clone(&saved));
        *current = Arc::clone(&installed);

        Ok(MethodHandle::new(type_name, method_name, installed, saved))
    }

    fn remove_method_interceptor(&self, handle: &MethodHandle) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if let Some(current) = tables
            .types
            .get_mut(handle.type_name())
            .and_then(|methods| methods.get_mut(handle.method_name()))
        {
            if Arc::ptr_eq(current, handle.installed()) {
                *current = Arc::clone(handle.saved());
            }
        }
        Ok(())
    }
}

impl LineInterceptor for Runtime {
    fn install_line_interceptor(
        &self,
        target: Option<&CompiledUnit>,
        file: &str,
        line: u32,
        callback: LineCallback,
    ) -> Result<LineHandle> {
        let mut tables = self.tables.write().unwrap();
        if let Some(unit) = target {
            if !tables.units.values().flatten().any(|u| u.id() == unit.id()) {
                return Err(Error::Install(format!(
                    "unit {} of {} is not loaded",
                    unit.id(),
                    unit.path()
                )));
            }
        }

        let id = self.next_id();
        tables.traces.push(LineTrace {
            id,
            unit: target.map(CompiledUnit::id),
            line,
            callback,
        });

        Ok(LineHandle {
            id,
            file: file.to_string(),
            line,
        })
    }

    fn remove_line_interceptor(&self, handle: LineHandle) -> Result<()> {
        self.tables
            .write()
            .unwrap()
            .traces
            .retain(|t| t.id != handle.id);
        Ok(())
    }
}

impl DefinitionSource for Runtime {
    fn subscribe_definitions(&self, observer: Weak<dyn DefinitionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id());
        self.definition_observers
            .lock()
            .unwrap()
            .push((id, observer));
        id
    }

    fn unsubscribe_definitions(&self, id: SubscriptionId) {
        self.definition_observers
            .lock()
            .unwrap()
            .retain(|(i, _)| *i != id);
    }
}

impl CompileSource for Runtime {
    fn subscribe_compiles(&self, observer: Weak<dyn CompileObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id());
        self.compile_observers.lock().unwrap().push((id, observer));
        id
    }

    fn unsubscribe_compiles(&self, id: SubscriptionId) {
        self.compile_observers
            .lock()
            .unwrap()
            .retain(|(i, _)| *i != id);
    }

    fn loaded_units(&self) -> Vec<CompiledUnit> {
        let mut units: Vec<_> = self
            .tables
            .read()
            .unwrap()
            .units
            .values()
            .flatten()
            .cloned()
            .collect();
        units.sort_by_key(CompiledUnit::id);
        units
    }
}
