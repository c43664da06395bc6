use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, info, warn};

use super::Probe;
use crate::{
    core::hook::{
        HookManager, HookTarget, InstallObserver, LineCallback, LineEvent, MethodCallback,
        MethodHit,
    },
    error::{Error, Result},
    notify::{EventSink, Execution, NotificationBuilder},
};

/// What probe callbacks need when they fire.
struct ExecContext {
    builder: Arc<NotificationBuilder>,
    sink: Arc<dyn EventSink>,
    propagate: bool,
}

impl ExecContext {
    fn executed(&self, probe: &Probe, execution: Execution<'_>) {
        if let Some(limiter) = probe.rate_limiter() {
            if !limiter.try_acquire() {
                return;
            }
        }
        self.sink.add_status(self.builder.build_emitting(probe));
        self.sink
            .add_snapshot(self.builder.build_executed(probe, execution));
    }

    /// Run probe processing, making sure it never unwinds into the host
    /// unless asked to.
    fn guard<F: FnOnce()>(&self, probe: &Probe, f: F) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
            if self.propagate {
                panic::resume_unwind(panic);
            }
            warn!("Probe {} failed while handling an execution", probe.id());
        }
    }
}

/// Probes sharing a hook location. A location has a single hook, firing for
/// all of them.
type Group = Arc<RwLock<Vec<Arc<Probe>>>>;

#[derive(Default)]
struct ProbeState {
    installed: HashMap<String, Arc<Probe>>,
    pending: HashMap<String, Arc<Probe>>,
    groups: HashMap<HookTarget, Group>,
}

impl ProbeState {
    /// Is another probe than `id` using the hook of `target`?
    fn shares_hook(&self, target: &HookTarget, id: &str) -> bool {
        self.groups
            .get(target)
            .is_some_and(|g| g.read().unwrap().iter().any(|p| p.id() != id))
    }

    /// Take a probe out of its location group. Returns true if the group is
    /// now empty, and so is the hook.
    fn leave_group(&mut self, target: &HookTarget, id: &str) -> bool {
        let empty = match self.groups.get(target) {
            Some(group) => {
                let mut probes = group.write().unwrap();
                probes.retain(|p| p.id() != id);
                probes.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove(target);
        }
        empty
    }
}

/// Tracks the probes defined remotely and their hooks.
pub struct ProbeManager {
    hooks: Arc<HookManager>,
    ctx: Arc<ExecContext>,
    state: Mutex<ProbeState>,
}

impl ProbeManager {
    pub fn new(
        hooks: Arc<HookManager>,
        builder: Arc<NotificationBuilder>,
        sink: Arc<dyn EventSink>,
        propagate: bool,
    ) -> Self {
        Self {
            hooks,
            ctx: Arc::new(ExecContext {
                builder,
                sink,
                propagate,
            }),
            state: Mutex::new(ProbeState::default()),
        }
    }

    /// Install the hook of a probe. A probe whose target is not loaded yet is
    /// kept pending and installed later. Probes already known are ignored.
    pub fn add_probe(&self, probe: Probe) -> Result<()> {
        let probe = Arc::new(probe);
        let id = probe.id().to_string();

        let mut state = self.state.lock().unwrap();
        if state.installed.contains_key(&id) || state.pending.contains_key(&id) {
            debug!("Probe {id} already known");
            return Ok(());
        }

        let Some(target) = probe.hook_target()? else {
            debug!("Probe {id} has no usable location, ignoring it");
            return Ok(());
        };

        let installed = match state.groups.get(&target).cloned() {
            // The location is already hooked, or waiting to be.
            Some(group) => {
                let mut probes = group.write().unwrap();
                let hooked = probes.iter().any(|p| state.installed.contains_key(p.id()));
                probes.push(Arc::clone(&probe));
                hooked
            }
            None => {
                let group: Group = Arc::new(RwLock::new(vec![Arc::clone(&probe)]));
                let installed = match &target {
                    HookTarget::Method {
                        type_name,
                        method_name,
                    } => self.hooks.hook_method_when_defined(
                        type_name,
                        method_name,
                        self.method_callback(&group),
                    )?,
                    HookTarget::Line { file, line } => self.hooks.hook_line_when_defined(
                        file,
                        *line,
                        self.line_callback(&group),
                    )?,
                };
                state.groups.insert(target.clone(), group);
                installed
            }
        };

        if installed {
            info!("Probe {id} installed on {target}");
            state.installed.insert(id, Arc::clone(&probe));
            self.ctx.sink.add_status(self.ctx.builder.build_installed(&probe));
        } else {
            info!("Probe {id} pending, {target} is not loaded yet");
            state.pending.insert(id, probe);
        }
        Ok(())
    }

    fn method_callback(&self, group: &Group) -> MethodCallback {
        let ctx = Arc::clone(&self.ctx);
        let group = Arc::clone(group);
        Arc::new(move |hit: &MethodHit<'_>| {
            group.read().unwrap().iter().for_each(|probe| {
                ctx.guard(probe, || ctx.executed(probe, Execution::Method(hit)))
            })
        })
    }

    fn line_callback(&self, group: &Group) -> LineCallback {
        let ctx = Arc::clone(&self.ctx);
        let group = Arc::clone(group);
        Arc::new(move |event: &LineEvent<'_>| {
            group.read().unwrap().iter().for_each(|probe| {
                ctx.guard(probe, || ctx.executed(probe, Execution::Line(event)))
            })
        })
    }

    /// Drop every probe whose id is not in `current`. Installed probes are
    /// unhooked first and only forgotten if that worked. A hook shared with a
    /// probe that stays is kept.
    pub fn remove_other_probes(&self, current: &HashSet<String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let stale: Vec<String> = state
            .pending
            .keys()
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(probe) = state.pending.remove(&id) {
                if let Ok(Some(target)) = probe.hook_target() {
                    if state.leave_group(&target, &id) {
                        self.hooks.clear_pending(&target);
                    }
                }
                debug!("Removed pending probe {id}");
            }
        }

        let stale: Vec<(String, Arc<Probe>)> = state
            .installed
            .iter()
            .filter(|(id, _)| !current.contains(*id))
            .map(|(id, probe)| (id.clone(), Arc::clone(probe)))
            .collect();

        let mut failure: Option<Error> = None;
        for (id, probe) in stale {
            let target = match probe.hook_target() {
                Ok(Some(target)) => target,
                _ => {
                    state.installed.remove(&id);
                    continue;
                }
            };
            let unhooked = match state.shares_hook(&target, &id) {
                true => Ok(()),
                false => self.hooks.unhook(&target),
            };
            match unhooked {
                Ok(()) => {
                    state.leave_group(&target, &id);
                    state.installed.remove(&id);
                    info!("Removed probe {id}");
                }
                Err(e) => {
                    warn!("Could not remove probe {id}: {e}");
                    if self.ctx.propagate && failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.state.lock().unwrap().installed.contains_key(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.state.lock().unwrap().pending.contains_key(id)
    }

    pub fn installed_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().unwrap().installed.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().unwrap().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove all hooks and forget all probes.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        self.hooks.close();
        state.installed.clear();
        state.pending.clear();
        state.groups.clear();
    }
}

impl InstallObserver for ProbeManager {
    fn hook_installed(&self, target: &HookTarget) {
        let mut state = self.state.lock().unwrap();
        let ready: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.hook_target(), Ok(Some(t)) if &t == target))
            .map(|(id, _)| id.clone())
            .collect();

        for id in ready {
            if let Some(probe) = state.pending.remove(&id) {
                info!("Pending probe {id} installed on {target}");
                self.ctx.sink.add_status(self.ctx.builder.build_installed(&probe));
                state.installed.insert(id, probe);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use events::ProbeStatus;
    use serde_json::json;

    use super::*;
    use crate::{
        capture::{Limits, Redactor, Serializer, Value},
        config::Settings,
        core::{
            code::CodeRegistry,
            hook::CallArgs,
            probe::{ProbeBuilder, ProbeLocation},
        },
        host::{self, Runtime},
        notify::worker::tests::RecordingSink,
    };

    struct Fixture {
        rt: Arc<Runtime>,
        hooks: Arc<HookManager>,
        sink: Arc<RecordingSink>,
        probes: Arc<ProbeManager>,
    }

    fn fixture(propagate: bool) -> Fixture {
        let rt = Arc::new(Runtime::new());
        let code = Arc::new(CodeRegistry::new());
        code.start(rt.as_ref());
        let hooks = Arc::new(HookManager::new(rt.clone(), Some(code), false));
        hooks.subscribe();

        let redactor = Redactor::new(&Settings::default()).unwrap();
        let builder = Arc::new(NotificationBuilder::new(
            "svc",
            Arc::new(Serializer::new(redactor, Limits::default())),
        ));
        let sink = Arc::new(RecordingSink::default());
        let probes = Arc::new(ProbeManager::new(
            Arc::clone(&hooks),
            builder,
            sink.clone(),
            propagate,
        ));
        hooks.set_install_observer(Arc::downgrade(&probes) as Weak<ProbeManager>);

        Fixture {
            rt,
            hooks,
            sink,
            probes,
        }
    }

    fn define_calc(rt: &Runtime) {
        rt.define_type(
            "Calc",
            [(
                "double",
                host::method(|inv| match inv.args.positional.first() {
                    Some(Value::Integer(i)) => Value::Integer(i * 2),
                    _ => Value::Nil,
                }),
            )],
        );
    }

    fn line_probe(id: &str, file: &str, line: u32) -> Probe {
        Probe::new(
            id,
            "LOG_PROBE",
            ProbeLocation::Line {
                file: file.to_string(),
                lines: vec![line],
            },
        )
    }

    fn method_probe(id: &str) -> Probe {
        Probe::new(
            id,
            "LOG_PROBE",
            ProbeLocation::Method {
                type_name: "Calc".to_string(),
                method_name: "double".to_string(),
            },
        )
    }

    fn ids(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn install_now() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10]);

        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();
        assert!(f.probes.is_installed("a"));
        assert_eq!(f.sink.statuses_of("a"), vec![ProbeStatus::Installed]);
    }

    #[test]
    fn pending_then_installed() {
        let f = fixture(false);

        f.probes.add_probe(method_probe("m")).unwrap();
        assert!(f.probes.is_pending("m"));
        assert!(f.sink.statuses_of("m").is_empty());

        define_calc(&f.rt);
        assert!(f.probes.is_installed("m"));
        assert!(!f.probes.is_pending("m"));
        assert_eq!(f.sink.statuses_of("m"), vec![ProbeStatus::Installed]);

        f.rt.call("Calc", "double", CallArgs::positional([Value::from(2)]))
            .unwrap();
        assert_eq!(
            f.sink.statuses_of("m"),
            vec![ProbeStatus::Installed, ProbeStatus::Emitting]
        );
        assert_eq!(f.sink.snapshots.lock().unwrap().len(), 1);
    }

    #[test]
    fn known_ids_are_skipped() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10]);

        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();
        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();
        assert_eq!(f.sink.statuses_of("a"), vec![ProbeStatus::Installed]);
        assert_eq!(f.rt.line_trace_count(), 1);
    }

    #[test]
    fn inert_probe() {
        let f = fixture(false);
        let probe = ProbeBuilder::build_from_remote_config(&json!({
            "id": "i",
            "type": "LOG_PROBE",
            "where": {"sourceFile": "f.rb", "lines": [null]},
        }))
        .unwrap();

        assert!(f.probes.add_probe(probe).is_ok());
        assert!(!f.probes.is_installed("i"));
        assert!(!f.probes.is_pending("i"));
    }

    #[test]
    fn multiple_lines_fail() {
        let f = fixture(false);
        let probe = Probe::new(
            "ml",
            "LOG_PROBE",
            ProbeLocation::Line {
                file: "f.rb".to_string(),
                lines: vec![1, 2],
            },
        );
        assert!(matches!(
            f.probes.add_probe(probe),
            Err(Error::MultipleLines(_))
        ));
    }

    #[test]
    fn remove_other_probes() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10, 20]);
        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();
        f.probes.add_probe(line_probe("b", "f.rb", 20)).unwrap();
        f.probes.add_probe(method_probe("p")).unwrap();
        assert_eq!(f.probes.installed_ids(), vec!["a", "b"]);
        assert_eq!(f.probes.pending_ids(), vec!["p"]);

        f.probes.remove_other_probes(&ids(&["a"])).unwrap();

        assert_eq!(f.probes.installed_ids(), vec!["a"]);
        assert!(f.probes.pending_ids().is_empty());
        assert!(!f.hooks.is_installed(&HookTarget::line("f.rb", 20)));
        assert!(f.hooks.is_installed(&HookTarget::line("f.rb", 10)));
        assert!(!f.hooks.is_pending(&HookTarget::method("Calc", "double")));

        // B does not fire anymore, A still does.
        f.rt.execute_line("/app/f.rb", 20, &[]);
        f.rt.execute_line("/app/f.rb", 10, &[]);
        assert!(!f.sink.statuses_of("b").contains(&ProbeStatus::Emitting));
        assert!(f.sink.statuses_of("a").contains(&ProbeStatus::Emitting));
    }

    #[test]
    fn shared_line_location() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10]);
        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();
        f.probes.add_probe(line_probe("b", "f.rb", 10)).unwrap();
        assert_eq!(f.probes.installed_ids(), vec!["a", "b"]);
        assert_eq!(f.sink.statuses_of("b"), vec![ProbeStatus::Installed]);
        assert_eq!(f.rt.line_trace_count(), 1);

        f.rt.execute_line("/app/f.rb", 10, &[]);
        assert_eq!(f.sink.snapshots.lock().unwrap().len(), 2);

        // Removing B keeps the hook A relies on.
        f.probes.remove_other_probes(&ids(&["a"])).unwrap();
        assert_eq!(f.probes.installed_ids(), vec!["a"]);
        assert!(f.hooks.is_installed(&HookTarget::line("f.rb", 10)));
        assert_eq!(f.rt.line_trace_count(), 1);

        f.rt.execute_line("/app/f.rb", 10, &[]);
        assert_eq!(
            f.sink.statuses_of("a"),
            vec![
                ProbeStatus::Installed,
                ProbeStatus::Emitting,
                ProbeStatus::Emitting
            ]
        );
        assert_eq!(
            f.sink.statuses_of("b"),
            vec![ProbeStatus::Installed, ProbeStatus::Emitting]
        );

        // The last probe leaving removes the hook.
        f.probes.remove_other_probes(&HashSet::new()).unwrap();
        assert!(!f.hooks.is_installed(&HookTarget::line("f.rb", 10)));
        assert_eq!(f.rt.line_trace_count(), 0);
    }

    #[test]
    fn shared_pending_location() {
        let f = fixture(false);
        f.probes.add_probe(method_probe("m1")).unwrap();
        f.probes.add_probe(method_probe("m2")).unwrap();
        f.probes.add_probe(method_probe("m3")).unwrap();
        assert_eq!(f.probes.pending_ids(), vec!["m1", "m2", "m3"]);

        // The hook stays pending while one of its probes is left.
        f.probes.remove_other_probes(&ids(&["m1", "m2"])).unwrap();
        assert!(f.hooks.is_pending(&HookTarget::method("Calc", "double")));

        define_calc(&f.rt);
        assert_eq!(f.probes.installed_ids(), vec!["m1", "m2"]);

        f.rt.call("Calc", "double", CallArgs::positional([Value::from(1)]))
            .unwrap();
        assert!(f.sink.statuses_of("m1").contains(&ProbeStatus::Emitting));
        assert!(f.sink.statuses_of("m2").contains(&ProbeStatus::Emitting));
        assert!(f.sink.statuses_of("m3").is_empty());
    }

    #[test]
    fn rate_limited_snapshots() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10]);
        f.probes
            .add_probe(line_probe("a", "f.rb", 10).with_capture_snapshot(true))
            .unwrap();

        (0..5).for_each(|_| f.rt.execute_line("/app/f.rb", 10, &[]));
        assert_eq!(f.sink.snapshots.lock().unwrap().len(), 1);
    }

    #[test]
    fn not_capturing_is_not_limited() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10]);
        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();

        (0..5).for_each(|_| f.rt.execute_line("/app/f.rb", 10, &[]));
        assert_eq!(f.sink.snapshots.lock().unwrap().len(), 5);
    }

    /// Sink failing on every snapshot.
    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn add_status(&self, _: events::StatusEnvelope) {}
        fn add_snapshot(&self, _: events::SnapshotEnvelope) {
            panic!("sink failure");
        }
    }

    fn panicking(propagate: bool) -> (Arc<Runtime>, Arc<ProbeManager>) {
        let rt = Arc::new(Runtime::new());
        let hooks = Arc::new(HookManager::new(rt.clone(), None, false));
        let redactor = Redactor::new(&Settings::default()).unwrap();
        let builder = Arc::new(NotificationBuilder::new(
            "svc",
            Arc::new(Serializer::new(redactor, Limits::default())),
        ));
        let probes = Arc::new(ProbeManager::new(
            hooks,
            builder,
            Arc::new(PanickingSink),
            propagate,
        ));
        define_calc(&rt);
        probes.add_probe(method_probe("m")).unwrap();
        (rt, probes)
    }

    #[test]
    fn failures_do_not_reach_the_host() {
        let (rt, _probes) = panicking(false);
        let rv = rt
            .call("Calc", "double", CallArgs::positional([Value::from(4)]))
            .unwrap();
        assert!(matches!(rv, Value::Integer(8)));
    }

    #[test]
    #[should_panic(expected = "sink failure")]
    fn failures_propagate_when_asked() {
        let (rt, _probes) = panicking(true);
        let _ = rt.call("Calc", "double", CallArgs::positional([Value::from(4)]));
    }

    #[test]
    fn close_forgets_everything() {
        let f = fixture(false);
        f.rt.load_unit("/app/f.rb", [10]);
        f.probes.add_probe(line_probe("a", "f.rb", 10)).unwrap();
        f.probes.add_probe(method_probe("m")).unwrap();

        f.probes.close();
        assert!(f.probes.installed_ids().is_empty());
        assert!(f.probes.pending_ids().is_empty());
        assert_eq!(f.hooks.counts(), (0, 0));
        assert_eq!(f.rt.line_trace_count(), 0);
    }
}
