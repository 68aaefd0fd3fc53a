//! Per-field config reload dispatcher.
//!
//! Instead of a monolithic if/else chain in the config watcher callback,
//! each class of config change maps to a classified action: Warn (log
//! only), Callback (custom handler), or Restart (cancel the daemon's root
//! context for a clean teardown and reinitialization, short-circuiting the
//! remaining rules).

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, DiffResult};

/// How a matching rule is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Log the rule name, take no action.
    Warn,
    /// Invoke the rule's handler.
    Callback,
    /// Invoke the dispatcher's restart hook and stop evaluating rules.
    Restart,
}

pub type MatchFn = Box<dyn Fn(&DiffResult) -> bool + Send + Sync>;
pub type HandleFn = Box<dyn Fn(&Arc<Config>, &Arc<Config>, &DiffResult) + Send + Sync>;
pub type PrologueFn = Box<dyn Fn(&Arc<Config>, &Arc<Config>) + Send + Sync>;
pub type RestartFn = Box<dyn Fn() + Send + Sync>;

/// A single config-change reaction.
pub struct Rule {
    pub name: &'static str,
    pub kind: ActionKind,
    pub matches: MatchFn,
    /// Callback rules only.
    pub handle: Option<HandleFn>,
}

/// Evaluates registered rules against config diffs.
pub struct Dispatcher {
    prologues: Vec<PrologueFn>,
    rules: Vec<Rule>,
    restart: RestartFn,
}

impl Dispatcher {
    /// `restart` is invoked when a Restart rule matches; it should cancel
    /// the daemon's mount context.
    pub fn new(restart: RestartFn) -> Self {
        Self {
            prologues: Vec::new(),
            rules: Vec::new(),
            restart,
        }
    }

    /// Register an unconditional hook that runs before any rule, in
    /// registration order, on every dispatch.
    pub fn on_always(&mut self, prologue: PrologueFn) {
        self.prologues.push(prologue);
    }

    /// Append a rule.  Rules are evaluated in registration order.
    pub fn register(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Run every prologue, then each matching rule in order.  A Restart
    /// rule fires the restart hook and stops evaluation.
    pub fn dispatch(&self, old: &Arc<Config>, new: &Arc<Config>, diff: &DiffResult) {
        for prologue in &self.prologues {
            prologue(old, new);
        }

        for rule in &self.rules {
            if !(rule.matches)(diff) {
                continue;
            }
            match rule.kind {
                ActionKind::Warn => {
                    info!(rule = rule.name, "config change requires attention");
                }
                ActionKind::Callback => {
                    if let Some(handle) = &rule.handle {
                        handle(old, new, diff);
                    }
                }
                ActionKind::Restart => {
                    info!(rule = rule.name, "config change requires restart");
                    (self.restart)();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, diff};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Box<dyn Fn() + Send + Sync>) {
        let c = Arc::new(AtomicUsize::new(0));
        let cb = Arc::clone(&c);
        (c, Box::new(move || {
            cb.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn changed_backend_diff() -> (Arc<Config>, Arc<Config>, DiffResult) {
        let old = Arc::new(Config::default());
        let mut new = Config::default();
        new.settings.mount.backend = BackendKind::Fifo;
        let new = Arc::new(new);
        let d = diff(&old, &new);
        (old, new, d)
    }

    #[test]
    fn prologues_always_run_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (restart_count, restart) = counter();
        let mut dispatcher = Dispatcher::new(restart);

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            dispatcher.on_always(Box::new(move |_, _| {
                order.lock().unwrap().push(tag);
            }));
        }

        let (old, new, d) = changed_backend_diff();
        dispatcher.dispatch(&old, &new, &d);

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(restart_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_rules_fire_on_match_only() {
        let (_restarts, restart) = counter();
        let mut dispatcher = Dispatcher::new(restart);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        dispatcher.register(Rule {
            name: "on-settings-change",
            kind: ActionKind::Callback,
            matches: Box::new(|d| d.settings_changed()),
            handle: Some(Box::new(move |_, _, _| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })),
        });

        let skipped = Arc::new(AtomicUsize::new(0));
        let skipped_cb = Arc::clone(&skipped);
        dispatcher.register(Rule {
            name: "on-files-change",
            kind: ActionKind::Callback,
            matches: Box::new(|d| d.files_changed()),
            handle: Some(Box::new(move |_, _, _| {
                skipped_cb.fetch_add(1, Ordering::SeqCst);
            })),
        });

        let (old, new, d) = changed_backend_diff();
        dispatcher.dispatch(&old, &new, &d);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_short_circuits_remaining_rules() {
        let (restarts, restart) = counter();
        let mut dispatcher = Dispatcher::new(restart);

        dispatcher.register(Rule {
            name: "restart-mount",
            kind: ActionKind::Restart,
            matches: Box::new(|_| true),
            handle: None,
        });

        let after = Arc::new(AtomicUsize::new(0));
        let after_cb = Arc::clone(&after);
        dispatcher.register(Rule {
            name: "never-reached",
            kind: ActionKind::Callback,
            matches: Box::new(|_| true),
            handle: Some(Box::new(move |_, _, _| {
                after_cb.fetch_add(1, Ordering::SeqCst);
            })),
        });

        let (old, new, d) = changed_backend_diff();
        dispatcher.dispatch(&old, &new, &d);

        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn warn_rules_take_no_action() {
        let (restarts, restart) = counter();
        let mut dispatcher = Dispatcher::new(restart);
        dispatcher.register(Rule {
            name: "heads-up",
            kind: ActionKind::Warn,
            matches: Box::new(|_| true),
            handle: None,
        });

        let (old, new, d) = changed_backend_diff();
        dispatcher.dispatch(&old, &new, &d);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }
}
