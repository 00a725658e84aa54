//! # State Machine
//!
//! Table-driven hierarchical finite-state machine.
//!
//! A [`Machine`] is a set of transition rows `(source, event, target,
//! action, guard)` plus on-entry actions. A state of a machine may own a
//! nested machine; while that state is active, the nested machine runs too.
//! The interpreter keeps the active state of every level on a stack:
//!
//! ```text
//! level 0:  NORMAL ──(owns)──► level 1:  STOPPED ──start──► STARTED
//! stack:    [NORMAL, STOPPED]            after start: [NORMAL, STARTED]
//! ```
//!
//! Events are offered to the innermost level first. The first row whose
//! source is the active state of its level and whose guard passes fires:
//! its action runs, deeper levels are popped, the target becomes active and
//! the entry actions of the target (and of the initial states of any nested
//! machine it owns) run. An event no level handles leaves the stack as it
//! is and calls the no-transition handler.
//!
//! `errorFound` is accepted in every state and moves the machine to
//! [`State::Error`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use karabo_data::{Hash, KaraboError, Result, State};
use tracing::{debug, warn};

/// Event that moves any machine to `Error`.
pub const ERROR_FOUND: &str = "errorFound";

/// Guard of a transition row.
pub type Guard<C> = Arc<dyn Fn(&C, &Hash) -> bool + Send + Sync>;
/// Action of a transition row.
pub type Action<C> = Arc<dyn Fn(&mut C, &Hash) -> Result<()> + Send + Sync>;
/// On-entry action of a state.
pub type EntryAction<C> = Arc<dyn Fn(&mut C) -> Result<()> + Send + Sync>;
/// Called with `(context, event, state)` for unhandled events.
pub type NoTransition<C> = Arc<dyn Fn(&mut C, &str, State) + Send + Sync>;

struct Row<C> {
    source: State,
    event: String,
    target: State,
    action: Option<Action<C>>,
    guard: Option<Guard<C>>,
}

/// One level of a hierarchical state machine.
pub struct Machine<C> {
    name: String,
    initial: State,
    rows: Vec<Row<C>>,
    entries: HashMap<State, EntryAction<C>>,
    nested: HashMap<State, Machine<C>>,
}

impl<C> fmt::Debug for Machine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("rows", &self.rows.len())
            .field("nested", &self.nested.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C> Machine<C> {
    /// Start a machine whose initial state is `initial`.
    #[must_use]
    pub fn builder(name: &str, initial: State) -> MachineBuilder<C> {
        MachineBuilder {
            machine: Machine {
                name: name.to_string(),
                initial,
                rows: Vec::new(),
                entries: HashMap::new(),
                nested: HashMap::new(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn initial(&self) -> State {
        self.initial
    }

    /// Every event named in this machine or a nested one.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.rows.iter().map(|r| r.event.clone()).collect();
        for nested in self.nested.values() {
            events.extend(nested.events());
        }
        events.sort();
        events.dedup();
        events
    }
}

/// Fluent construction of a [`Machine`].
pub struct MachineBuilder<C> {
    machine: Machine<C>,
}

impl<C> MachineBuilder<C> {
    /// Plain row: `event` in `source` moves to `target`.
    #[must_use]
    pub fn transition(self, source: State, event: &str, target: State) -> Self {
        self.row(source, event, target, None, None)
    }

    /// Row with an action.
    #[must_use]
    pub fn transition_with<A>(self, source: State, event: &str, target: State, action: A) -> Self
    where
        A: Fn(&mut C, &Hash) -> Result<()> + Send + Sync + 'static,
    {
        self.row(source, event, target, Some(Arc::new(action)), None)
    }

    /// Row with a guard and an optional action.
    #[must_use]
    pub fn guarded<G>(self, source: State, event: &str, target: State, guard: G, action: Option<Action<C>>) -> Self
    where
        G: Fn(&C, &Hash) -> bool + Send + Sync + 'static,
    {
        self.row(source, event, target, action, Some(Arc::new(guard)))
    }

    fn row(mut self, source: State, event: &str, target: State, action: Option<Action<C>>, guard: Option<Guard<C>>) -> Self {
        self.machine.rows.push(Row {
            source,
            event: event.to_string(),
            target,
            action,
            guard,
        });
        self
    }

    /// Run `entry` whenever `state` becomes active.
    #[must_use]
    pub fn on_entry<E>(mut self, state: State, entry: E) -> Self
    where
        E: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.machine.entries.insert(state, Arc::new(entry));
        self
    }

    /// Attach a machine that runs while `state` is active.
    #[must_use]
    pub fn nested(mut self, state: State, machine: Machine<C>) -> Self {
        self.machine.nested.insert(state, machine);
        self
    }

    #[must_use]
    pub fn build(self) -> Machine<C> {
        self.machine
    }
}

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Transitioned { from: State, to: State },
    /// No row matched (or every matching guard refused).
    NoTransition { state: State },
}

/// Interpreter of a [`Machine`] tree.
pub struct Fsm<C> {
    root: Machine<C>,
    stack: Vec<State>,
    no_transition: Option<NoTransition<C>>,
    started: bool,
}

impl<C> fmt::Debug for Fsm<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("machine", &self.root.name)
            .field("stack", &self.stack)
            .finish()
    }
}

impl<C> Fsm<C> {
    #[must_use]
    pub fn new(root: Machine<C>) -> Self {
        Self {
            stack: vec![root.initial],
            root,
            no_transition: None,
            started: false,
        }
    }

    /// Replace the default handler (a warning) for unhandled events.
    pub fn set_no_transition<F>(&mut self, handler: F)
    where
        F: Fn(&mut C, &str, State) + Send + Sync + 'static,
    {
        self.no_transition = Some(Arc::new(handler));
    }

    /// Innermost active state.
    #[must_use]
    pub fn state(&self) -> State {
        self.stack.last().copied().unwrap_or(self.root.initial)
    }

    /// Active state of every level, outermost first.
    #[must_use]
    pub fn active_states(&self) -> &[State] {
        &self.stack
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Enter the initial states and run their entry actions.
    pub fn start(&mut self, ctx: &mut C) -> Result<State> {
        if self.started {
            return Ok(self.state());
        }
        self.started = true;
        self.stack.clear();
        self.enter(0, self.root.initial, ctx)?;
        Ok(self.state())
    }

    /// Machine running at `level` of the current stack.
    fn machine_at(&self, level: usize) -> Option<&Machine<C>> {
        let mut machine = &self.root;
        for state in self.stack.iter().take(level) {
            machine = machine.nested.get(state)?;
        }
        Some(machine)
    }

    /// Make `state` active at `level`, then descend into nested initial
    /// states.
    fn enter(&mut self, level: usize, state: State, ctx: &mut C) -> Result<()> {
        self.stack.truncate(level);
        self.stack.push(state);
        let mut current = level;
        loop {
            let Some(machine) = self.machine_at(current) else {
                return Ok(());
            };
            let active = self.stack[current];
            if let Some(entry) = machine.entries.get(&active).cloned() {
                entry(ctx)?;
            }
            let Some(inner) = self.machine_at(current).and_then(|m| m.nested.get(&active)) else {
                return Ok(());
            };
            let initial = inner.initial;
            self.stack.push(initial);
            current += 1;
        }
    }

    /// Offer `event` with its arguments.
    ///
    /// A failing action or entry action moves the machine to `Error` and
    /// returns the failure.
    pub fn process(&mut self, event: &str, args: &Hash, ctx: &mut C) -> Result<Outcome> {
        if !self.started {
            self.start(ctx)?;
        }
        let from = self.state();
        if event == ERROR_FOUND {
            self.stack.clear();
            self.stack.push(State::Error);
            debug!(machine = %self.root.name, from = %from, "errorFound");
            return Ok(Outcome::Transitioned { from, to: State::Error });
        }

        for level in (0..self.stack.len()).rev() {
            let Some(machine) = self.machine_at(level) else {
                continue;
            };
            let active = self.stack[level];
            let row = machine
                .rows
                .iter()
                .filter(|r| r.source == active && r.event == event)
                .find(|r| r.guard.as_ref().map_or(true, |g| g(&*ctx, args)))
                .map(|r| (r.target, r.action.clone()));
            let Some((target, action)) = row else {
                continue;
            };
            if let Some(action) = action {
                if let Err(e) = action(ctx, args) {
                    self.fail(from, event, &e);
                    return Err(e);
                }
            }
            if let Err(e) = self.enter(level, target, ctx) {
                self.fail(from, event, &e);
                return Err(e);
            }
            let to = self.state();
            debug!(machine = %self.root.name, event = event, from = %from, to = %to, "Transition");
            return Ok(Outcome::Transitioned { from, to });
        }

        match self.no_transition.clone() {
            Some(handler) => handler(ctx, event, from),
            None => warn!(machine = %self.root.name, event = event, state = %from, "No transition"),
        }
        Ok(Outcome::NoTransition { state: from })
    }

    fn fail(&mut self, from: State, event: &str, error: &KaraboError) {
        warn!(
            machine = %self.root.name,
            event = event,
            state = %from,
            error = %error,
            "Transition failed, entering ERROR"
        );
        self.stack.clear();
        self.stack.push(State::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        entries: Vec<String>,
        allow: bool,
        unhandled: Vec<String>,
    }

    fn motor() -> Machine<Log> {
        let inner = Machine::builder("Motion", State::Stopped)
            .transition(State::Stopped, "start", State::Started)
            .transition(State::Started, "stop", State::Stopped)
            .on_entry(State::Started, |log: &mut Log| {
                log.entries.push("started".into());
                Ok(())
            })
            .build();
        Machine::builder("Motor", State::Init)
            .transition(State::Init, "initialized", State::Normal)
            .guarded(State::Normal, "disable", State::Disabled, |log: &Log, _| log.allow, None)
            .transition(State::Error, "reset", State::Normal)
            .transition_with(State::Normal, "break", State::Off, |_, _| {
                Err(KaraboError::Fatal("hardware".into()))
            })
            .on_entry(State::Normal, |log: &mut Log| {
                log.entries.push("normal".into());
                Ok(())
            })
            .nested(State::Normal, inner)
            .build()
    }

    #[test]
    fn test_nested_machine_enters_initial_state() {
        let mut log = Log::default();
        let mut fsm = Fsm::new(motor());
        assert_eq!(fsm.start(&mut log).unwrap(), State::Init);

        let outcome = fsm.process("initialized", &Hash::new(), &mut log).unwrap();
        assert_eq!(
            outcome,
            Outcome::Transitioned { from: State::Init, to: State::Stopped }
        );
        assert_eq!(fsm.active_states(), &[State::Normal, State::Stopped]);
        assert_eq!(log.entries, vec!["normal"]);

        fsm.process("start", &Hash::new(), &mut log).unwrap();
        assert_eq!(fsm.state(), State::Started);
        assert_eq!(log.entries, vec!["normal", "started"]);
    }

    #[test]
    fn test_unhandled_event_keeps_state() {
        let mut log = Log::default();
        let mut fsm = Fsm::new(motor());
        fsm.set_no_transition(|log: &mut Log, event, _| log.unhandled.push(event.to_string()));
        fsm.start(&mut log).unwrap();
        let outcome = fsm.process("start", &Hash::new(), &mut log).unwrap();
        assert_eq!(outcome, Outcome::NoTransition { state: State::Init });
        assert_eq!(log.unhandled, vec!["start"]);
    }

    #[test]
    fn test_guard_blocks_transition() {
        let mut log = Log::default();
        let mut fsm = Fsm::new(motor());
        fsm.process("initialized", &Hash::new(), &mut log).unwrap();
        assert!(matches!(
            fsm.process("disable", &Hash::new(), &mut log).unwrap(),
            Outcome::NoTransition { .. }
        ));
        log.allow = true;
        fsm.process("disable", &Hash::new(), &mut log).unwrap();
        assert_eq!(fsm.active_states(), &[State::Disabled]);
    }

    #[test]
    fn test_outer_row_pops_nested_level() {
        let mut log = Log::default();
        let mut fsm = Fsm::new(motor());
        fsm.process("initialized", &Hash::new(), &mut log).unwrap();
        fsm.process("start", &Hash::new(), &mut log).unwrap();
        log.allow = true;
        fsm.process("disable", &Hash::new(), &mut log).unwrap();
        assert_eq!(fsm.active_states(), &[State::Disabled]);
    }

    #[test]
    fn test_error_found_from_anywhere_and_failed_action() {
        let mut log = Log::default();
        let mut fsm = Fsm::new(motor());
        fsm.process("initialized", &Hash::new(), &mut log).unwrap();
        fsm.process(ERROR_FOUND, &Hash::new(), &mut log).unwrap();
        assert_eq!(fsm.state(), State::Error);

        fsm.process("reset", &Hash::new(), &mut log).unwrap();
        assert_eq!(fsm.state(), State::Stopped);
        assert!(fsm.process("break", &Hash::new(), &mut log).is_err());
        assert_eq!(fsm.state(), State::Error);
    }
}
