//! The connection automaton: the authoritative answer to "what is this
//!  endpoint allowed to do right now". It is deliberately free of any
//!  transport knowledge - sequence numbers, buffers and timers live in
//!  [`crate::connection`]; this module only enforces the transition graph and
//!  records where a connection has been.

use crate::error::{Result, TransportError};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::CloseWait => "CLOSE_WAIT",
            State::Closing => "CLOSING",
            State::LastAck => "LAST_ACK",
            State::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    PassiveOpen,
    ActiveOpen,
    Syn,
    SynAck,
    Ack,
    Fin,
    FinAck,
    Close,
    Timeout,
    Rst,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Event::PassiveOpen => "PASSIVE_OPEN",
            Event::ActiveOpen => "ACTIVE_OPEN",
            Event::Syn => "SYN",
            Event::SynAck => "SYN_ACK",
            Event::Ack => "ACK",
            Event::Fin => "FIN",
            Event::FinAck => "FIN_ACK",
            Event::Close => "CLOSE",
            Event::Timeout => "TIMEOUT",
            Event::Rst => "RST",
        };
        f.write_str(s)
    }
}

/// One successfully processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub event: Event,
    pub to: State,
}

pub type TransitionCallback = Arc<dyn Fn(State, State, Event) + Send + Sync>;
pub type RefusalCallback = Arc<dyn Fn(State, Event, TransportError) + Send + Sync>;

/// The successor state for a legal (state, event) pair, `None` for an illegal
///  one. A reset is legal everywhere and always leads to `Closed`.
fn successor(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    if event == Rst {
        return Some(Closed);
    }

    let next = match (state, event) {
        (Closed, PassiveOpen) => Listen,
        (Closed, ActiveOpen) => SynSent,

        (Listen, Syn) => SynReceived,
        (Listen, Close) => Closed,

        (SynSent, Syn) => SynReceived,
        (SynSent, SynAck) => Established,
        (SynSent, Close) => Closed,
        (SynSent, Timeout) => Closed,

        (SynReceived, Ack) => Established,
        (SynReceived, Close) => FinWait1,
        (SynReceived, Timeout) => Closed,

        (Established, Fin) => CloseWait,
        (Established, Close) => FinWait1,

        (FinWait1, Ack) => FinWait2,
        (FinWait1, Fin) => Closing,
        (FinWait1, FinAck) => TimeWait,

        (FinWait2, Fin) => TimeWait,

        (CloseWait, Close) => LastAck,

        (Closing, Ack) => TimeWait,

        (LastAck, Ack) => Closed,

        (TimeWait, Timeout) => Closed,

        _ => return None,
    };
    Some(next)
}

struct StateMachineInner {
    state: State,
    history: Vec<Transition>,
    history_cap: usize,
}

impl StateMachineInner {
    fn push_history(&mut self, transition: Transition) {
        self.history.push(transition);
        if self.history.len() > self.history_cap {
            self.history.remove(0);
        }
    }
}

/// All operations are linearizable; event processing is serialized on the
///  internal lock. The lock is released *before* the registered callbacks run,
///  so a callback may re-enter the state machine without deadlocking - this is
///  an invariant callers may rely on.
pub struct StateMachine {
    inner: Mutex<StateMachineInner>,
    on_transition: RwLock<Option<TransitionCallback>>,
    on_refusal: RwLock<Option<RefusalCallback>>,
}

impl StateMachine {
    pub fn new() -> StateMachine {
        StateMachine::with_history_cap(100)
    }

    pub fn with_history_cap(history_cap: usize) -> StateMachine {
        StateMachine {
            inner: Mutex::new(StateMachineInner {
                state: State::Closed,
                history: Vec::new(),
                history_cap,
            }),
            on_transition: RwLock::new(None),
            on_refusal: RwLock::new(None),
        }
    }

    /// Invoked after every successful transition with (old, new, event).
    pub fn set_transition_callback(&self, callback: impl Fn(State, State, Event) + Send + Sync + 'static) {
        *self.on_transition.write().unwrap() = Some(Arc::new(callback));
    }

    /// Invoked after every refused event with (state, event, reason).
    pub fn set_refusal_callback(&self, callback: impl Fn(State, Event, TransportError) + Send + Sync + 'static) {
        *self.on_refusal.write().unwrap() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Apply `event`, returning the new state. An illegal event fails with
    ///  [`TransportError::InvalidTransition`] and leaves the state untouched.
    pub fn process_event(&self, event: Event) -> Result<State> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            match successor(inner.state, event) {
                Some(next) => {
                    let from = inner.state;
                    inner.state = next;
                    inner.push_history(Transition { from, event, to: next });
                    Ok((from, next))
                }
                None => Err(TransportError::InvalidTransition {
                    state: inner.state,
                    event,
                }),
            }
        };

        // no lock is held while a callback runs - callbacks may re-enter
        match outcome {
            Ok((from, to)) => {
                let callback = self.on_transition.read().unwrap().clone();
                if let Some(callback) = callback {
                    callback(from, to, event);
                }
                Ok(to)
            }
            Err(e) => {
                let callback = self.on_refusal.read().unwrap().clone();
                if let Some(callback) = callback {
                    let TransportError::InvalidTransition { state, .. } = e else {
                        unreachable!()
                    };
                    callback(state, event, e);
                }
                Err(e)
            }
        }
    }

    /// An independent copy of the transition history, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.inner.lock().unwrap().history.clone()
    }

    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }

    /// Back to `Closed` with an empty history. Callbacks stay registered.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        inner.history.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck | State::TimeWait | State::CloseWait
        )
    }

    pub fn can_send_data(&self) -> bool {
        matches!(self.state(), State::Established | State::CloseWait)
    }

    pub fn can_receive_data(&self) -> bool {
        matches!(self.state(), State::Established | State::FinWait1 | State::FinWait2)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ALL_STATES: [State; 11] = [
        State::Closed,
        State::Listen,
        State::SynSent,
        State::SynReceived,
        State::Established,
        State::FinWait1,
        State::FinWait2,
        State::CloseWait,
        State::Closing,
        State::LastAck,
        State::TimeWait,
    ];

    const ALL_EVENTS: [Event; 10] = [
        Event::PassiveOpen,
        Event::ActiveOpen,
        Event::Syn,
        Event::SynAck,
        Event::Ack,
        Event::Fin,
        Event::FinAck,
        Event::Close,
        Event::Timeout,
        Event::Rst,
    ];

    /// Drive a fresh machine along `events` and check the resulting states.
    fn walk(events: &[Event], expected: &[State]) -> StateMachine {
        let machine = StateMachine::new();
        for (event, expected_state) in events.iter().zip(expected) {
            assert_eq!(machine.process_event(*event), Ok(*expected_state));
        }
        machine
    }

    #[test]
    fn test_active_handshake() {
        let machine = walk(
            &[Event::ActiveOpen, Event::SynAck],
            &[State::SynSent, State::Established],
        );
        assert!(machine.is_connected());
    }

    #[test]
    fn test_passive_handshake() {
        let machine = walk(
            &[Event::PassiveOpen, Event::Syn, Event::Ack],
            &[State::Listen, State::SynReceived, State::Established],
        );
        assert!(machine.is_connected());
    }

    #[test]
    fn test_simultaneous_open() {
        walk(
            &[Event::ActiveOpen, Event::Syn, Event::Ack],
            &[State::SynSent, State::SynReceived, State::Established],
        );
    }

    #[test]
    fn test_active_close() {
        let machine = walk(
            &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::Ack, Event::Fin, Event::Timeout],
            &[
                State::SynSent,
                State::Established,
                State::FinWait1,
                State::FinWait2,
                State::TimeWait,
                State::Closed,
            ],
        );
        assert!(machine.is_closed());
    }

    #[test]
    fn test_passive_close() {
        walk(
            &[Event::PassiveOpen, Event::Syn, Event::Ack, Event::Fin, Event::Close, Event::Ack],
            &[
                State::Listen,
                State::SynReceived,
                State::Established,
                State::CloseWait,
                State::LastAck,
                State::Closed,
            ],
        );
    }

    #[test]
    fn test_simultaneous_close() {
        walk(
            &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::Fin, Event::Ack, Event::Timeout],
            &[
                State::SynSent,
                State::Established,
                State::FinWait1,
                State::Closing,
                State::TimeWait,
                State::Closed,
            ],
        );
    }

    #[test]
    fn test_fin_ack_collapses_to_time_wait() {
        walk(
            &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::FinAck],
            &[State::SynSent, State::Established, State::FinWait1, State::TimeWait],
        );
    }

    #[rstest]
    #[case::closed(&[])]
    #[case::listen(&[Event::PassiveOpen])]
    #[case::established(&[Event::ActiveOpen, Event::SynAck])]
    #[case::fin_wait_2(&[Event::ActiveOpen, Event::SynAck, Event::Close, Event::Ack])]
    #[case::time_wait(&[Event::ActiveOpen, Event::SynAck, Event::Close, Event::FinAck])]
    fn test_rst_always_closes(#[case] prefix: &[Event]) {
        let machine = StateMachine::new();
        for event in prefix {
            machine.process_event(*event).unwrap();
        }
        assert_eq!(machine.process_event(Event::Rst), Ok(State::Closed));
    }

    /// Every (state, event) pair the table marks illegal is refused without a
    ///  state change, and the refusal is reported through the callback.
    #[test]
    fn test_refusals_leave_state_unchanged() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                if successor(state, event).is_some() {
                    continue;
                }

                let machine = machine_in(state);
                let refused = Arc::new(AtomicUsize::new(0));
                let refused_in_callback = refused.clone();
                machine.set_refusal_callback(move |cb_state, cb_event, reason| {
                    assert_eq!(cb_state, state);
                    assert_eq!(cb_event, event);
                    assert_eq!(reason, TransportError::InvalidTransition { state, event });
                    refused_in_callback.fetch_add(1, Ordering::SeqCst);
                });

                let history_before = machine.history();
                assert_eq!(
                    machine.process_event(event),
                    Err(TransportError::InvalidTransition { state, event })
                );
                assert_eq!(machine.state(), state);
                assert_eq!(machine.history(), history_before);
                assert_eq!(refused.load(Ordering::SeqCst), 1);
            }
        }
    }

    /// A machine brought into `state` via legal transitions (or a reset for
    ///  `Closed` itself).
    fn machine_in(state: State) -> StateMachine {
        let events: &[Event] = match state {
            State::Closed => &[],
            State::Listen => &[Event::PassiveOpen],
            State::SynSent => &[Event::ActiveOpen],
            State::SynReceived => &[Event::PassiveOpen, Event::Syn],
            State::Established => &[Event::ActiveOpen, Event::SynAck],
            State::FinWait1 => &[Event::ActiveOpen, Event::SynAck, Event::Close],
            State::FinWait2 => &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::Ack],
            State::CloseWait => &[Event::ActiveOpen, Event::SynAck, Event::Fin],
            State::Closing => &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::Fin],
            State::LastAck => &[Event::ActiveOpen, Event::SynAck, Event::Fin, Event::Close],
            State::TimeWait => &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::FinAck],
        };
        let machine = StateMachine::new();
        for event in events {
            machine.process_event(*event).unwrap();
        }
        assert_eq!(machine.state(), state);
        machine
    }

    #[test]
    fn test_history_records_transitions() {
        let machine = walk(
            &[Event::ActiveOpen, Event::SynAck],
            &[State::SynSent, State::Established],
        );

        assert_eq!(
            machine.history(),
            vec![
                Transition { from: State::Closed, event: Event::ActiveOpen, to: State::SynSent },
                Transition { from: State::SynSent, event: Event::SynAck, to: State::Established },
            ]
        );
    }

    /// The (from, to) projection of the history is a valid walk: each record's
    ///  `to` is the next record's `from`, and each step is in the table.
    #[test]
    fn test_history_is_a_valid_walk() {
        let machine = walk(
            &[Event::ActiveOpen, Event::SynAck, Event::Close, Event::Ack, Event::Fin, Event::Timeout],
            &[
                State::SynSent,
                State::Established,
                State::FinWait1,
                State::FinWait2,
                State::TimeWait,
                State::Closed,
            ],
        );

        let history = machine.history();
        for window in history.windows(2) {
            assert_eq!(window[0].to, window[1].from);
        }
        for transition in &history {
            assert_eq!(successor(transition.from, transition.event), Some(transition.to));
        }
    }

    #[test]
    fn test_history_trimmed_at_cap() {
        let machine = StateMachine::with_history_cap(3);
        machine.process_event(Event::ActiveOpen).unwrap();
        machine.process_event(Event::SynAck).unwrap();
        machine.process_event(Event::Close).unwrap();
        machine.process_event(Event::Ack).unwrap();

        let history = machine.history();
        assert_eq!(history.len(), 3);
        // oldest record dropped
        assert_eq!(history[0].event, Event::SynAck);
        assert_eq!(history[2].event, Event::Ack);
    }

    #[test]
    fn test_history_returns_independent_copy() {
        let machine = StateMachine::new();
        machine.process_event(Event::ActiveOpen).unwrap();

        let mut copy = machine.history();
        copy.clear();

        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_clear_history_keeps_state() {
        let machine = machine_in(State::Established);
        machine.clear_history();
        assert!(machine.history().is_empty());
        assert_eq!(machine.state(), State::Established);
    }

    #[test]
    fn test_reset() {
        let machine = machine_in(State::Established);
        machine.reset();
        assert_eq!(machine.state(), State::Closed);
        assert!(machine.history().is_empty());

        // a reset machine accepts a fresh open
        assert_eq!(machine.process_event(Event::ActiveOpen), Ok(State::SynSent));
    }

    #[test]
    fn test_transition_callback() {
        let machine = StateMachine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        machine.set_transition_callback(move |from, to, event| {
            seen_in_callback.lock().unwrap().push((from, to, event));
        });

        machine.process_event(Event::ActiveOpen).unwrap();
        machine.process_event(Event::SynAck).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (State::Closed, State::SynSent, Event::ActiveOpen),
                (State::SynSent, State::Established, Event::SynAck),
            ]
        );
    }

    /// Callbacks run outside the state lock, so re-entering the machine from
    ///  inside one must not deadlock.
    #[test]
    fn test_callback_may_reenter() {
        let machine = Arc::new(StateMachine::new());
        let machine_in_callback = machine.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_in_callback = observed.clone();
        machine.set_transition_callback(move |_, _, _| {
            observed_in_callback
                .lock()
                .unwrap()
                .push(machine_in_callback.state());
        });

        machine.process_event(Event::ActiveOpen).unwrap();
        machine.process_event(Event::SynAck).unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![State::SynSent, State::Established]);
    }

    #[rstest]
    #[case::established(State::Established, true, false, false, true, true)]
    #[case::closed(State::Closed, false, true, false, false, false)]
    #[case::listen(State::Listen, false, false, false, false, false)]
    #[case::fin_wait_1(State::FinWait1, false, false, true, false, true)]
    #[case::fin_wait_2(State::FinWait2, false, false, true, false, true)]
    #[case::close_wait(State::CloseWait, false, false, true, true, false)]
    #[case::closing(State::Closing, false, false, true, false, false)]
    #[case::last_ack(State::LastAck, false, false, true, false, false)]
    #[case::time_wait(State::TimeWait, false, false, true, false, false)]
    fn test_derived_queries(
        #[case] state: State,
        #[case] connected: bool,
        #[case] closed: bool,
        #[case] closing: bool,
        #[case] can_send: bool,
        #[case] can_receive: bool,
    ) {
        let machine = machine_in(state);
        assert_eq!(machine.is_connected(), connected);
        assert_eq!(machine.is_closed(), closed);
        assert_eq!(machine.is_closing(), closing);
        assert_eq!(machine.can_send_data(), can_send);
        assert_eq!(machine.can_receive_data(), can_receive);
    }
}
