//! # Host capabilities
//!
//! The instrumentation engine does not know how the host runtime dispatches
//! methods or executes lines. It relies on the capabilities below, which the
//! host provides:
//!
//! - Method interception: the current body of a method is replaced with a
//!   wrapper built from it, and can later be restored.
//! - Line interception: a callback is invoked when a given line executes,
//!   either targeting a single compiled unit or the whole program.
//! - Definition and compilation events, so hooks on code not loaded yet can
//!   be installed when it shows up.

use std::sync::{Arc, Weak};

use events::StackFrame;

use crate::{capture::Value, core::code::CompiledUnit, error::Result};

/// Arguments of a method call.
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn positional<I: IntoIterator<Item = Value>>(args: I) -> Self {
        Self {
            positional: args.into_iter().collect(),
            named: Vec::new(),
        }
    }

    pub fn with_named<N: Into<String>, V: Into<Value>>(mut self, name: N, value: V) -> Self {
        self.named.push((name.into(), value.into()));
        self
    }
}

/// Provides the call stack of the thread an event is reported on. Only
/// queried when a hook actually fires.
pub trait StackSource {
    /// Innermost frame first.
    fn call_stack(&self) -> Vec<StackFrame>;
}

/// A method invocation, as seen by a method body.
pub struct Invocation<'a> {
    pub args: &'a CallArgs,
    stack: &'a dyn StackSource,
}

impl<'a> Invocation<'a> {
    pub fn new(args: &'a CallArgs, stack: &'a dyn StackSource) -> Self {
        Self { args, stack }
    }

    pub fn call_stack(&self) -> Vec<StackFrame> {
        self.stack.call_stack()
    }
}

/// Body of a method: what runs when the method is invoked.
pub type MethodBody = Arc<dyn Fn(&Invocation<'_>) -> Value + Send + Sync>;

/// Builds the intercepting body of a method out of its current one.
pub type MethodWrapper = Box<dyn FnOnce(MethodBody) -> MethodBody + Send>;

/// An installed method interceptor. Holds what is needed to undo it.
pub struct MethodHandle {
    type_name: String,
    method_name: String,
    /// Body installed by the interceptor.
    installed: MethodBody,
    /// Body in place before the interceptor.
    saved: MethodBody,
}

impl MethodHandle {
    pub fn new<T, M>(type_name: T, method_name: M, installed: MethodBody, saved: MethodBody) -> Self
    where
        T: Into<String>,
        M: Into<String>,
    {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
            installed,
            saved,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn installed(&self) -> &MethodBody {
        &self.installed
    }

    pub fn saved(&self) -> &MethodBody {
        &self.saved
    }
}

/// A line execution, as reported to line interceptors.
pub struct LineEvent<'a> {
    /// Path of the executing file.
    pub path: &'a str,
    pub line: u32,
    /// Local variables visible at that line.
    pub locals: &'a [(String, Value)],
    stack: &'a dyn StackSource,
}

impl<'a> LineEvent<'a> {
    pub fn new(
        path: &'a str,
        line: u32,
        locals: &'a [(String, Value)],
        stack: &'a dyn StackSource,
    ) -> Self {
        Self {
            path,
            line,
            locals,
            stack,
        }
    }

    pub fn call_stack(&self) -> Vec<StackFrame> {
        self.stack.call_stack()
    }
}

pub type LineCallback = Arc<dyn Fn(&LineEvent<'_>) + Send + Sync>;

/// An installed line interceptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineHandle {
    /// Host specific identifier of the interceptor.
    pub id: u64,
    pub file: String,
    pub line: u32,
}

/// Identifier of an event subscription.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(pub u64);

pub trait MethodInterceptor: Send + Sync {
    /// Replace the body of `type_name`'s `method_name` with the one built by
    /// `wrap`. Fails with `TargetNotDefined` if the type or the method does
    /// not exist.
    fn install_method_interceptor(
        &self,
        type_name: &str,
        method_name: &str,
        wrap: MethodWrapper,
    ) -> Result<MethodHandle>;

    /// Undo an interceptor. The saved body is only put back if the
    /// interceptor is still the current body of the method.
    fn remove_method_interceptor(&self, handle: &MethodHandle) -> Result<()>;
}

pub trait LineInterceptor: Send + Sync {
    /// Have `callback` invoked when `line` of `file` executes. A `None` target
    /// means untargeted tracing: the callback is invoked on every line
    /// executed by the program and has to filter events itself.
    fn install_line_interceptor(
        &self,
        target: Option<&CompiledUnit>,
        file: &str,
        line: u32,
        callback: LineCallback,
    ) -> Result<LineHandle>;

    fn remove_line_interceptor(&self, handle: LineHandle) -> Result<()>;
}

/// Receives "type became defined" events.
pub trait DefinitionObserver: Send + Sync {
    fn type_defined(&self, type_name: &str);
}

/// Receives "code unit compiled" events.
pub trait CompileObserver: Send + Sync {
    fn unit_compiled(&self, unit: &CompiledUnit);
}

pub trait DefinitionSource: Send + Sync {
    fn subscribe_definitions(&self, observer: Weak<dyn DefinitionObserver>) -> SubscriptionId;
    fn unsubscribe_definitions(&self, id: SubscriptionId);
}

pub trait CompileSource: Send + Sync {
    fn subscribe_compiles(&self, observer: Weak<dyn CompileObserver>) -> SubscriptionId;
    fn unsubscribe_compiles(&self, id: SubscriptionId);

    /// Units loaded so far, oldest first. Hosts not able to list them only
    /// report units compiled after subscribing.
    fn loaded_units(&self) -> Vec<CompiledUnit> {
        Vec::new()
    }
}

/// All the capabilities the engine needs from the host.
pub trait HostRuntime: MethodInterceptor + LineInterceptor + DefinitionSource + CompileSource {}

impl<T> HostRuntime for T where
    T: MethodInterceptor + LineInterceptor + DefinitionSource + CompileSource
{
}
