//! Deterministic finite-state machine engine.
//!
//! The engine associates `(current state, input)` pairs with an action and
//! a destination state. It has two use modes that share one transition
//! table:
//!
//! - **token stepping** via [`Fsm::process`]: each call feeds one
//!   application-level token (a protocol line, a prompt-delimited chunk);
//!   this is how protocol dialogs are driven.
//! - **text scanning** via [`Fsm::process_string`]: the input is consumed
//!   from the current position, literal rules eating their symbol and regex
//!   rules eating exactly the span they matched, so one call may fire many
//!   transitions; this is how small parsers are built.
//!
//! Rule selection is deterministic: literal rules beat regex rules, regex
//! rules beat the per-state default, which beats the global default. Among
//! regex rules for the same state, the first one registered wins. If
//! nothing matches, [`process`](Fsm::process) fails with
//! [`FsmError::NoTransition`] and the current state is left unchanged; the
//! engine never swallows that error; the owning dialog decides what is
//! fatal.
//!
//! Actions receive the matched [`Input`] and the machine's [`Registers`]:
//! an accumulator for building values across transitions, a small value
//! stack, and an outbox that dialog actions emit outbound bytes into. A
//! dialog that wants to end moves the machine to a state its driver treats
//! as terminal; drivers check the state after every step instead of
//! unwinding through errors.
//!
//! ```
//! use marionette::fsm::{action, Fsm};
//!
//! let mut fsm = Fsm::new(0);
//! fsm.add_regex("[0-9]", 0, action(|i, r| Ok(r.accumulate(i.symbol))), 0)
//!     .unwrap();
//! fsm.process_string("42").unwrap();
//! assert_eq!(fsm.registers().accumulator(), "42");
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

use regex::Regex;

use crate::result::{FsmError, PatternError};

/// The matched input handed to a transition action.
#[derive(Debug)]
pub struct Input<'a> {
    /// The token (token mode) or the consumed span (scan mode).
    pub symbol: &'a str,
    /// Regex capture groups; index 0 is the whole match. Empty for
    /// literal, any, and default rules.
    pub captures: Vec<String>,
}

impl Input<'_> {
    /// Capture group by index, if the rule was a regex and the group
    /// participated in the match.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).map(String::as_str)
    }
}

/// A boxed transition action.
///
/// Actions may mutate the registers and may abort the dialog by returning
/// an error, which propagates out of [`Fsm::process`] without changing
/// state.
pub type Action = Box<dyn FnMut(&Input<'_>, &mut Registers) -> Result<(), FsmError>>;

/// Wrap a closure as a transition action.
pub fn action<F>(f: F) -> Option<Action>
where
    F: FnMut(&Input<'_>, &mut Registers) -> Result<(), FsmError> + 'static,
{
    Some(Box::new(f))
}

/// What a transition rule matches on.
#[derive(Debug)]
pub enum Symbol {
    /// The exact token (token mode) or a literal prefix (scan mode).
    Exact(String),
    /// A regular expression.
    Regex(Regex),
    /// Anything; the per-state default.
    Any,
}

impl Symbol {
    /// Literal symbol.
    pub fn exact(s: impl Into<String>) -> Self {
        Symbol::Exact(s.into())
    }

    /// Regex symbol.
    ///
    /// # Errors
    ///
    /// Fails on invalid regex syntax.
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Ok(Symbol::Regex(Regex::new(pattern)?))
    }
}

/// Mutable scratch state shared by all actions of one machine.
#[derive(Default)]
pub struct Registers {
    accumulator: String,
    stack: Vec<String>,
    outbox: VecDeque<Vec<u8>>,
}

impl Registers {
    /// Current accumulator contents.
    pub fn accumulator(&self) -> &str {
        &self.accumulator
    }

    /// Append text to the accumulator.
    pub fn accumulate(&mut self, text: &str) {
        self.accumulator.push_str(text);
    }

    /// Clear the accumulator.
    pub fn clear_accumulator(&mut self) {
        self.accumulator.clear();
    }

    /// Return the accumulator contents, leaving it empty.
    pub fn take_accumulator(&mut self) -> String {
        std::mem::take(&mut self.accumulator)
    }

    /// Push a value onto the stack.
    pub fn push(&mut self, value: impl Into<String>) {
        self.stack.push(value.into());
    }

    /// Pop the most recent stack value.
    pub fn pop(&mut self) -> Option<String> {
        self.stack.pop()
    }

    /// Queue outbound bytes for the dialog driver to write.
    pub fn emit(&mut self, bytes: impl Into<Vec<u8>>) {
        self.outbox.push_back(bytes.into());
    }

    /// Queue an outbound line (newline appended).
    pub fn emit_line(&mut self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.outbox.push_back(bytes);
    }

    fn clear(&mut self) {
        self.accumulator.clear();
        self.stack.clear();
        self.outbox.clear();
    }
}

struct Rule<S> {
    action: Option<Action>,
    next: S,
}

/// A finite-state machine over states of type `S`.
///
/// `S` is typically a small `Copy` enum or an integer. The transition
/// table is registered up front and treated as immutable once a dialog is
/// running; the machine itself is single-writer and meant to live on one
/// thread (actions are plain boxed closures).
pub struct Fsm<S> {
    initial: S,
    current: S,
    exact: HashMap<S, HashMap<String, Rule<S>>>,
    regex: HashMap<S, Vec<(Regex, Rule<S>)>>,
    any: HashMap<S, Rule<S>>,
    fallback: Option<Rule<S>>,
    registers: Registers,
}

impl<S: Copy + Eq + Hash + Debug> Fsm<S> {
    /// Create a machine resting in `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            current: initial,
            exact: HashMap::new(),
            regex: HashMap::new(),
            any: HashMap::new(),
            fallback: None,
            registers: Registers::default(),
        }
    }

    /// The current state.
    pub fn state(&self) -> S {
        self.current
    }

    /// Read access to the registers.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Mutable access to the registers (e.g. to seed the accumulator).
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// Return to the initial state and clear all registers.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.registers.clear();
    }

    /// Register a transition `(symbol, from) -> (action, to)`.
    pub fn add_transition(&mut self, symbol: Symbol, from: S, action: Option<Action>, to: S) {
        match symbol {
            Symbol::Exact(s) => {
                self.exact
                    .entry(from)
                    .or_default()
                    .insert(s, Rule { action, next: to });
            }
            Symbol::Regex(re) => {
                self.regex
                    .entry(from)
                    .or_default()
                    .push((re, Rule { action, next: to }));
            }
            Symbol::Any => {
                self.any.insert(from, Rule { action, next: to });
            }
        }
    }

    /// Register a literal transition.
    pub fn add_exact(&mut self, symbol: impl Into<String>, from: S, action: Option<Action>, to: S) {
        self.add_transition(Symbol::Exact(symbol.into()), from, action, to);
    }

    /// Register a regex transition. Regexes registered earlier for the same
    /// state are tried first.
    ///
    /// # Errors
    ///
    /// Fails on invalid regex syntax.
    pub fn add_regex(
        &mut self,
        pattern: &str,
        from: S,
        action: Option<Action>,
        to: S,
    ) -> Result<(), PatternError> {
        self.add_transition(Symbol::regex(pattern)?, from, action, to);
        Ok(())
    }

    /// Register the per-state default, taken when nothing else matches in
    /// `from`.
    pub fn add_default_transition(&mut self, from: S, action: Option<Action>, to: S) {
        self.add_transition(Symbol::Any, from, action, to);
    }

    /// Register the global fallback, taken when a state has no matching
    /// rule and no per-state default.
    pub fn set_default_transition(&mut self, action: Option<Action>, to: S) {
        self.fallback = Some(Rule { action, next: to });
    }

    /// Step the machine on one token.
    ///
    /// Returns the new current state. Fails with
    /// [`FsmError::NoTransition`] (leaving the state unchanged) when no
    /// rule (including defaults) applies, or with whatever error the
    /// action returned.
    pub fn process(&mut self, symbol: &str) -> Result<S, FsmError> {
        let state = self.current;

        if let Some(rules) = self.exact.get_mut(&state) {
            if let Some(rule) = rules.get_mut(symbol) {
                let input = Input {
                    symbol,
                    captures: Vec::new(),
                };
                return fire(rule, &input, &mut self.registers, &mut self.current);
            }
        }

        if let Some(rules) = self.regex.get_mut(&state) {
            for (re, rule) in rules.iter_mut() {
                if let Some(caps) = re.captures(symbol) {
                    let input = Input {
                        symbol,
                        captures: collect_captures(&caps),
                    };
                    return fire(rule, &input, &mut self.registers, &mut self.current);
                }
            }
        }

        if let Some(rule) = self.any.get_mut(&state) {
            let input = Input {
                symbol,
                captures: Vec::new(),
            };
            return fire(rule, &input, &mut self.registers, &mut self.current);
        }

        if let Some(rule) = self.fallback.as_mut() {
            let input = Input {
                symbol,
                captures: Vec::new(),
            };
            return fire(rule, &input, &mut self.registers, &mut self.current);
        }

        Err(FsmError::NoTransition {
            state: format!("{state:?}"),
            symbol: symbol.to_string(),
        })
    }

    /// Scan a string, firing transitions until the input is consumed.
    ///
    /// Feeding the same text in several chunks is equivalent to feeding it
    /// at once, as long as no chunk boundary splits a literal symbol or a
    /// regex span and the registers are not reset in between.
    pub fn process_string(&mut self, input: &str) -> Result<(), FsmError> {
        let mut pos = 0;
        while pos < input.len() {
            pos += self.scan_step(&input[pos..])?;
        }
        Ok(())
    }

    /// Drain the outbox filled by dialog actions.
    pub fn take_output(&mut self) -> Vec<Vec<u8>> {
        self.registers.outbox.drain(..).collect()
    }

    fn scan_step(&mut self, rest: &str) -> Result<usize, FsmError> {
        let state = self.current;

        // Longest literal prefix wins.
        if let Some(rules) = self.exact.get_mut(&state) {
            let best = rules
                .keys()
                .filter(|k| !k.is_empty() && rest.starts_with(k.as_str()))
                .max_by_key(|k| k.len())
                .cloned();
            if let Some(key) = best {
                let len = key.len();
                if let Some(rule) = rules.get_mut(&key) {
                    let input = Input {
                        symbol: &rest[..len],
                        captures: Vec::new(),
                    };
                    fire(rule, &input, &mut self.registers, &mut self.current)?;
                    return Ok(len);
                }
            }
        }

        // Regexes must match at the current position and consume the span.
        if let Some(rules) = self.regex.get_mut(&state) {
            for (re, rule) in rules.iter_mut() {
                if let Some(caps) = re.captures(rest) {
                    let whole = match caps.get(0) {
                        Some(m) if m.start() == 0 && m.end() > 0 => m,
                        _ => continue,
                    };
                    let input = Input {
                        symbol: whole.as_str(),
                        captures: collect_captures(&caps),
                    };
                    let consumed = whole.end();
                    fire(rule, &input, &mut self.registers, &mut self.current)?;
                    return Ok(consumed);
                }
            }
        }

        // Defaults consume a single character.
        let step = rest.chars().next().map(char::len_utf8).unwrap_or(1);
        let symbol = &rest[..step];
        let input = Input {
            symbol,
            captures: Vec::new(),
        };

        if let Some(rule) = self.any.get_mut(&state) {
            fire(rule, &input, &mut self.registers, &mut self.current)?;
            return Ok(step);
        }
        if let Some(rule) = self.fallback.as_mut() {
            fire(rule, &input, &mut self.registers, &mut self.current)?;
            return Ok(step);
        }

        Err(FsmError::NoTransition {
            state: format!("{state:?}"),
            symbol: symbol.to_string(),
        })
    }
}

fn fire<S: Copy>(
    rule: &mut Rule<S>,
    input: &Input<'_>,
    registers: &mut Registers,
    current: &mut S,
) -> Result<S, FsmError> {
    if let Some(act) = rule.action.as_mut() {
        act(input, registers)?;
    }
    *current = rule.next;
    Ok(rule.next)
}

fn collect_captures(caps: &regex::Captures<'_>) -> Vec<String> {
    caps.iter()
        .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn exact_beats_regex() {
        let mut fsm = Fsm::new(0);
        fsm.add_regex("QUIT", 0, None, 1).unwrap();
        fsm.add_exact("QUIT", 0, None, 2);
        assert_eq!(fsm.process("QUIT").unwrap(), 2);
    }

    #[test]
    fn regex_first_registered_wins() {
        let mut fsm = Fsm::new(0);
        fsm.add_regex("[0-9]+", 0, None, 1).unwrap();
        fsm.add_regex("25.", 0, None, 2).unwrap();
        assert_eq!(fsm.process("250").unwrap(), 1);
    }

    #[test]
    fn regex_captures_reach_the_action() {
        let seen = Rc::new(std::cell::RefCell::new(String::new()));
        let sink = seen.clone();
        let mut fsm = Fsm::new(1);
        fsm.add_regex(
            "^250 (.*)",
            1,
            action(move |input, _| {
                sink.borrow_mut().push_str(input.capture(1).unwrap_or(""));
                Ok(())
            }),
            2,
        )
        .unwrap();
        assert_eq!(fsm.process("250 OK").unwrap(), 2);
        assert_eq!(seen.borrow().as_str(), "OK");
    }

    #[test]
    fn missing_rule_is_an_error_and_state_holds() {
        let mut fsm = Fsm::new(7);
        fsm.add_exact("ping", 7, None, 8);
        let err = fsm.process("pong").unwrap_err();
        assert!(matches!(err, FsmError::NoTransition { .. }));
        assert_eq!(fsm.state(), 7);
    }

    #[test]
    fn per_state_default_beats_global_fallback() {
        let mut fsm = Fsm::new(0);
        fsm.add_default_transition(0, None, 5);
        fsm.set_default_transition(None, 9);
        assert_eq!(fsm.process("anything").unwrap(), 5);
        // State 5 has no rules at all, so the fallback applies.
        assert_eq!(fsm.process("anything").unwrap(), 9);
    }

    #[test]
    fn action_error_aborts_without_state_change() {
        let mut fsm = Fsm::new(0);
        fsm.add_exact(
            "die",
            0,
            action(|_, _| Err(FsmError::Aborted("boom".into()))),
            1,
        );
        assert!(matches!(fsm.process("die"), Err(FsmError::Aborted(_))));
        assert_eq!(fsm.state(), 0);
    }

    #[test]
    fn scan_consumes_regex_spans() {
        let mut fsm = Fsm::new(0);
        fsm.add_regex(
            "[0-9]+",
            0,
            action(|i, r| Ok(r.accumulate(i.symbol))),
            1,
        )
        .unwrap();
        fsm.add_exact(",", 1, None, 0);
        fsm.process_string("123,45,6").unwrap();
        assert_eq!(fsm.registers().accumulator(), "123456");
        assert_eq!(fsm.state(), 1);
    }

    #[test]
    fn scan_prefers_longest_literal() {
        let mut fsm = Fsm::new(0);
        fsm.add_exact("a", 0, None, 1);
        fsm.add_exact("ab", 0, None, 2);
        fsm.process_string("ab").unwrap();
        assert_eq!(fsm.state(), 2);
    }

    #[test]
    fn reset_restores_initial_state_and_registers() {
        let mut fsm = Fsm::new(0);
        fsm.add_default_transition(0, action(|i, r| Ok(r.accumulate(i.symbol))), 0);
        fsm.process_string("xyz").unwrap();
        fsm.reset();
        assert_eq!(fsm.state(), 0);
        assert_eq!(fsm.registers().accumulator(), "");
    }

    #[test]
    fn emitted_output_is_drained_in_order() {
        let mut fsm = Fsm::new(0);
        fsm.add_exact(
            "HELLO",
            0,
            action(|_, r| {
                r.emit_line("HI");
                r.emit_line("THERE");
                Ok(())
            }),
            1,
        );
        fsm.process("HELLO").unwrap();
        let out = fsm.take_output();
        assert_eq!(out, vec![b"HI\n".to_vec(), b"THERE\n".to_vec()]);
        assert!(fsm.take_output().is_empty());
    }

    /// A little timespan parser in the style the engine is meant for:
    /// digits accumulate, a unit letter applies a multiplier.
    fn timespan_parser(total: Rc<Cell<u64>>) -> Fsm<u8> {
        let mut fsm = Fsm::new(0);
        fsm.add_regex("[0-9]", 0, action(|i, r| Ok(r.accumulate(i.symbol))), 1)
            .unwrap();
        fsm.add_regex("[0-9]", 1, action(|i, r| Ok(r.accumulate(i.symbol))), 1)
            .unwrap();
        fsm.add_regex(
            "[dhms]",
            1,
            action(move |i, r| {
                let unit = match i.symbol {
                    "d" => 86_400,
                    "h" => 3_600,
                    "m" => 60,
                    _ => 1,
                };
                let value: u64 = r.take_accumulator().parse().map_err(|_| {
                    FsmError::Aborted("timespan value out of range".into())
                })?;
                total.set(total.get() + value * unit);
                Ok(())
            }),
            0,
        )
        .unwrap();
        fsm
    }

    #[test]
    fn timespan_parses_mixed_units() {
        let total = Rc::new(Cell::new(0));
        let mut fsm = timespan_parser(total.clone());
        fsm.process_string("1h30m").unwrap();
        assert_eq!(total.get(), 5400);
    }

    #[test]
    fn timespan_is_chunking_invariant() {
        let total = Rc::new(Cell::new(0));
        let mut fsm = timespan_parser(total.clone());
        fsm.process_string("1h3").unwrap();
        fsm.process_string("0m2s").unwrap();
        assert_eq!(total.get(), 5402);
    }

    fn scanner() -> Fsm<u8> {
        let mut fsm = Fsm::new(0);
        fsm.add_regex("[0-9]+", 0, action(|i, r| Ok(r.accumulate(i.symbol))), 1)
            .unwrap();
        fsm.add_regex("[0-9]+", 1, action(|i, r| Ok(r.accumulate(i.symbol))), 1)
            .unwrap();
        fsm.add_default_transition(0, None, 0);
        fsm.add_default_transition(1, None, 0);
        fsm
    }

    proptest! {
        #[test]
        fn replay_from_reset_is_deterministic(input in "[a-z0-9]{0,32}") {
            let mut fsm = scanner();
            fsm.process_string(&input).unwrap();
            let first_state = fsm.state();
            let first_acc = fsm.registers().accumulator().to_string();

            fsm.reset();
            fsm.process_string(&input).unwrap();
            prop_assert_eq!(first_state, fsm.state());
            prop_assert_eq!(first_acc, fsm.registers().accumulator());
        }
    }
}
