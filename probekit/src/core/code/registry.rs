use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use log::debug;

use super::basename;
use crate::core::hook::{CompileObserver, CompileSource, SubscriptionId};

/// Code loaded by the host for one source file. Used as the target of line
/// hooks. Never mutated once created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledUnit {
    /// Host identifier of the unit.
    id: u64,
    path: String,
    /// Lines holding executable code.
    lines: BTreeSet<u32>,
}

impl CompiledUnit {
    pub fn new<P: Into<String>, I: IntoIterator<Item = u32>>(id: u64, path: P, lines: I) -> Self {
        Self {
            id,
            path: path.into(),
            lines: lines.into_iter().collect(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_executable(&self, line: u32) -> bool {
        self.lines.contains(&line)
    }
}

/// Maps file identities to the compiled unit loaded for them.
///
/// Units are registered under their full path and under their basename; the
/// first unit registered for a key stays, later ones are ignored. Entries are
/// never removed.
#[derive(Default)]
pub struct CodeRegistry {
    units: RwLock<HashMap<String, Arc<CompiledUnit>>>,
    /// Is the registry receiving compilation events?
    active: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    /// Notified of newly registered units.
    listeners: Mutex<Vec<Weak<dyn CompileObserver>>>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking the code compiled by the host. Units the host loaded
    /// before are registered first.
    pub fn start<S: CompileSource + ?Sized>(self: &Arc<Self>, source: &S) {
        let mut subscription = self.subscription.lock().unwrap();
        if subscription.is_some() {
            return;
        }

        let observer: Weak<dyn CompileObserver> = Arc::downgrade(self) as Weak<CodeRegistry>;
        *subscription = Some(source.subscribe_compiles(observer));
        drop(subscription);

        let loaded = source.loaded_units();
        if !loaded.is_empty() {
            debug!("Registering {} units loaded before tracking", loaded.len());
        }
        loaded.into_iter().for_each(|unit| {
            self.register(unit.path().to_string(), unit);
        });

        self.active.store(true, Ordering::Release);
        debug!("Code tracking started");
    }

    /// Stop tracking compiled code. Known units are kept.
    pub fn stop<S: CompileSource + ?Sized>(&self, source: &S) {
        if let Some(id) = self.subscription.lock().unwrap().take() {
            source.unsubscribe_compiles(id);
            self.active.store(false, Ordering::Release);
            debug!("Code tracking stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Get notified when a unit is registered for the first time.
    pub fn add_listener(&self, listener: Weak<dyn CompileObserver>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Record a unit. Returns false if units were already registered for both
    /// its path and its basename, in which case nothing changes and listeners
    /// are not notified.
    pub fn register<P: AsRef<str>>(&self, path: P, unit: CompiledUnit) -> bool {
        let path = path.as_ref();
        let unit = Arc::new(unit);

        let added = {
            let mut units = self.units.write().unwrap();
            [path, basename(path)]
                .into_iter()
                .filter(|key| !key.is_empty())
                .fold(false, |added, key| {
                    if units.contains_key(key) {
                        return added;
                    }
                    units.insert(key.to_string(), Arc::clone(&unit));
                    true
                })
        };

        if added {
            debug!("Registered compiled unit for {path}");
            // Listeners are called without holding the registry lock, they
            // are likely to look units up.
            let listeners: Vec<_> = {
                let mut listeners = self.listeners.lock().unwrap();
                listeners.retain(|l| l.strong_count() > 0);
                listeners.iter().filter_map(Weak::upgrade).collect()
            };
            listeners.iter().for_each(|l| l.unit_compiled(&unit));
        }

        added
    }

    /// Find the unit loaded for a location, by exact path first and by
    /// basename then.
    pub fn lookup<P: AsRef<str>>(&self, location: P) -> Option<Arc<CompiledUnit>> {
        let location = location.as_ref();
        let units = self.units.read().unwrap();
        units
            .get(location)
            .or_else(|| units.get(basename(location)))
            .cloned()
    }
}

impl CompileObserver for CodeRegistry {
    fn unit_compiled(&self, unit: &CompiledUnit) {
        self.register(unit.path().to_string(), unit.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::host::Runtime;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl CompileObserver for Counter {
        fn unit_compiled(&self, _: &CompiledUnit) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_lookup() {
        let registry = CodeRegistry::new();

        assert!(registry.lookup("f.rb").is_none());
        assert!(registry.register("/app/f.rb", CompiledUnit::new(1, "/app/f.rb", [10])));

        assert_eq!(registry.lookup("/app/f.rb").unwrap().id(), 1);
        assert_eq!(registry.lookup("f.rb").unwrap().id(), 1);
        assert_eq!(registry.lookup("/other/dir/f.rb").unwrap().id(), 1);
        assert!(registry.lookup("g.rb").is_none());
    }

    #[test]
    fn first_registration_wins() {
        let registry = CodeRegistry::new();

        assert!(registry.register("/app/f.rb", CompiledUnit::new(1, "/app/f.rb", [10])));
        // Same path, ignored.
        assert!(!registry.register("/app/f.rb", CompiledUnit::new(2, "/app/f.rb", [10])));
        // New path, but the basename stays with the first unit.
        assert!(registry.register("/lib/f.rb", CompiledUnit::new(3, "/lib/f.rb", [1])));

        assert_eq!(registry.lookup("/app/f.rb").unwrap().id(), 1);
        assert_eq!(registry.lookup("/lib/f.rb").unwrap().id(), 3);
        assert_eq!(registry.lookup("f.rb").unwrap().id(), 1);
    }

    #[test]
    fn listeners() {
        let registry = CodeRegistry::new();
        let counter = Arc::new(Counter::default());
        let listener: Weak<dyn CompileObserver> = Arc::downgrade(&counter) as Weak<Counter>;
        registry.add_listener(listener);

        registry.register("/app/f.rb", CompiledUnit::new(1, "/app/f.rb", [10]));
        registry.register("/app/f.rb", CompiledUnit::new(2, "/app/f.rb", [10]));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // Dropped listeners are forgotten.
        drop(counter);
        registry.register("/app/g.rb", CompiledUnit::new(3, "/app/g.rb", [1]));
        assert!(registry.listeners.lock().unwrap().is_empty());
    }

    #[test]
    fn start_registers_loaded_units() {
        let rt = Runtime::new();
        rt.load_unit("/app/f.rb", [10]);
        rt.load_unit("/app/f.rb", [10, 11]);

        let registry = Arc::new(CodeRegistry::new());
        registry.start(&rt);
        assert!(registry.is_active());
        // The first unit loaded for the path wins, as if tracked live.
        assert_eq!(registry.lookup("f.rb").unwrap().id(), 1);

        rt.load_unit("/app/g.rb", [1]);
        assert!(registry.lookup("/app/g.rb").is_some());
        registry.stop(&rt);
    }

    #[test]
    fn executable_lines() {
        let unit = CompiledUnit::new(1, "f.rb", [3, 5]);

        assert!(unit.is_executable(3));
        assert!(!unit.is_executable(4));
        assert_eq!(unit.path(), "f.rb");
    }
}
