//! Statement and exception interceptor chains.
//!
//! Each session owns one [`CommandChain`] and one [`ExceptionChain`].
//! Interceptors run most-recently-registered first. Chains are not shared
//! between sessions, so the re-entrancy guard is a plain `Cell`.

use crate::error::ClientError;
use dbwire_protocol::{ColumnMeta, Statement, Value};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;

/// A materialized result produced without touching the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self {
            columns,
            ..Self::default()
        }
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = rows;
        self
    }
}

/// Hook consulted before a statement is sent.
pub trait StatementInterceptor: Send {
    fn name(&self) -> &str;

    /// Returns a result to short-circuit execution, or `None` to pass.
    ///
    /// `chain` is the chain this interceptor runs in; calling back into it
    /// from here yields `None`.
    fn try_handle(&self, statement: &Statement, chain: &CommandChain) -> Option<ResultSet>;
}

/// A statement interceptor.
pub enum CommandInterceptor {
    /// Logs every statement and never handles it.
    Trace,
    Custom(Box<dyn StatementInterceptor>),
}

impl CommandInterceptor {
    pub fn custom(interceptor: impl StatementInterceptor + 'static) -> Self {
        CommandInterceptor::Custom(Box::new(interceptor))
    }

    pub fn name(&self) -> &str {
        match self {
            CommandInterceptor::Trace => "trace",
            CommandInterceptor::Custom(i) => i.name(),
        }
    }

    fn try_handle(&self, statement: &Statement, chain: &CommandChain) -> Option<ResultSet> {
        match self {
            CommandInterceptor::Trace => {
                tracing::debug!(statement = %statement.describe(), "Executing statement");
                None
            }
            CommandInterceptor::Custom(i) => i.try_handle(statement, chain),
        }
    }
}

impl fmt::Debug for CommandInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandInterceptor").field(&self.name()).finish()
    }
}

/// Ordered statement interceptors with a re-entrancy guard.
#[derive(Debug, Default)]
pub struct CommandChain {
    interceptors: Vec<CommandInterceptor>,
    in_progress: Cell<bool>,
}

struct ResetOnDrop<'a>(&'a Cell<bool>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl CommandChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an interceptor. It runs before all earlier registrations.
    pub fn push(&mut self, interceptor: CommandInterceptor) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Offers the statement to each interceptor; the first result wins.
    pub fn try_handle(&self, statement: &Statement) -> Option<ResultSet> {
        if self.in_progress.replace(true) {
            tracing::trace!("Re-entrant interceptor call suppressed");
            return None;
        }
        let _reset = ResetOnDrop(&self.in_progress);

        self.interceptors.iter().rev().find_map(|interceptor| {
            let handled = interceptor.try_handle(statement, self);
            if handled.is_some() {
                tracing::debug!(interceptor = interceptor.name(), "Statement handled by interceptor");
            }
            handled
        })
    }
}

/// Hook applied to every error the session surfaces.
pub trait ErrorTransformer: Send {
    fn name(&self) -> &str;

    fn transform(&self, error: ClientError) -> ClientError;
}

/// An exception interceptor.
pub enum ExceptionInterceptor {
    /// Returns the error unchanged.
    Passthrough,
    Custom(Box<dyn ErrorTransformer>),
}

impl ExceptionInterceptor {
    pub fn custom(transformer: impl ErrorTransformer + 'static) -> Self {
        ExceptionInterceptor::Custom(Box::new(transformer))
    }

    pub fn name(&self) -> &str {
        match self {
            ExceptionInterceptor::Passthrough => "passthrough",
            ExceptionInterceptor::Custom(t) => t.name(),
        }
    }

    fn transform(&self, error: ClientError) -> ClientError {
        match self {
            ExceptionInterceptor::Passthrough => error,
            ExceptionInterceptor::Custom(t) => t.transform(error),
        }
    }
}

impl fmt::Debug for ExceptionInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExceptionInterceptor")
            .field(&self.name())
            .finish()
    }
}

/// Ordered error transformers, always terminated by a passthrough.
#[derive(Debug)]
pub struct ExceptionChain {
    interceptors: Vec<ExceptionInterceptor>,
}

impl Default for ExceptionChain {
    fn default() -> Self {
        Self {
            interceptors: vec![ExceptionInterceptor::Passthrough],
        }
    }
}

impl ExceptionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: ExceptionInterceptor) {
        self.interceptors.push(interceptor);
    }

    /// Number of interceptors, including the terminal passthrough.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Folds the error through every interceptor, newest first.
    pub fn transform(&self, error: ClientError) -> ClientError {
        self.interceptors
            .iter()
            .rev()
            .fold(error, |err, interceptor| interceptor.transform(err))
    }
}

type CommandFactory = Box<dyn Fn() -> CommandInterceptor + Send + Sync>;
type ExceptionFactory = Box<dyn Fn() -> ExceptionInterceptor + Send + Sync>;

/// Name to factory table used to build per-session chains from
/// configuration.
pub struct InterceptorRegistry {
    commands: HashMap<String, CommandFactory>,
    exceptions: HashMap<String, ExceptionFactory>,
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
            exceptions: HashMap::new(),
        };
        registry.register_command("trace", || CommandInterceptor::Trace);
        registry.register_exception("passthrough", || ExceptionInterceptor::Passthrough);
        registry
    }
}

impl fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        let mut exceptions: Vec<_> = self.exceptions.keys().collect();
        commands.sort();
        exceptions.sort();
        f.debug_struct("InterceptorRegistry")
            .field("commands", &commands)
            .field("exceptions", &exceptions)
            .finish()
    }
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> CommandInterceptor + Send + Sync + 'static,
    {
        self.commands
            .insert(name.into().to_ascii_lowercase(), Box::new(factory));
    }

    pub fn register_exception<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> ExceptionInterceptor + Send + Sync + 'static,
    {
        self.exceptions
            .insert(name.into().to_ascii_lowercase(), Box::new(factory));
    }

    /// Builds a command chain, registering `names` in order.
    pub fn command_chain(&self, names: &[String]) -> Result<CommandChain, ClientError> {
        let mut chain = CommandChain::new();
        for name in names {
            let factory = self.commands.get(&name.to_ascii_lowercase()).ok_or_else(|| {
                ClientError::Config(format!("unknown command interceptor '{}'", name))
            })?;
            chain.push(factory());
        }
        Ok(chain)
    }

    /// Builds an exception chain, registering `names` in order.
    pub fn exception_chain(&self, names: &[String]) -> Result<ExceptionChain, ClientError> {
        let mut chain = ExceptionChain::new();
        for name in names {
            let factory = self.exceptions.get(&name.to_ascii_lowercase()).ok_or_else(|| {
                ClientError::Config(format!("unknown exception interceptor '{}'", name))
            })?;
            chain.push(factory());
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbwire_protocol::{Collection, DataModel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        value: i64,
        calls: Arc<AtomicUsize>,
    }

    impl StatementInterceptor for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn try_handle(&self, _: &Statement, _: &CommandChain) -> Option<ResultSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(ResultSet::default().with_row(vec![Value::Sint(self.value)]))
        }
    }

    struct Recursing {
        inner_result: Arc<std::sync::Mutex<Option<bool>>>,
    }

    impl StatementInterceptor for Recursing {
        fn name(&self) -> &str {
            "recursing"
        }

        fn try_handle(&self, statement: &Statement, chain: &CommandChain) -> Option<ResultSet> {
            let inner = chain.try_handle(statement);
            *self.inner_result.lock().unwrap() = Some(inner.is_some());
            None
        }
    }

    struct Prefix(&'static str);

    impl ErrorTransformer for Prefix {
        fn name(&self) -> &str {
            self.0
        }

        fn transform(&self, error: ClientError) -> ClientError {
            ClientError::Config(format!("{}:{}", self.0, error))
        }
    }

    fn statement() -> Statement {
        Statement::find(Collection::new("users"), DataModel::Table)
    }

    #[test]
    fn test_most_recent_interceptor_wins() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let mut chain = CommandChain::new();
        chain.push(CommandInterceptor::custom(Fixed {
            name: "first",
            value: 1,
            calls: first_calls.clone(),
        }));
        chain.push(CommandInterceptor::Trace);
        chain.push(CommandInterceptor::custom(Fixed {
            name: "second",
            value: 2,
            calls: second_calls.clone(),
        }));

        let result = chain.try_handle(&statement()).unwrap();
        assert_eq!(result.rows, vec![vec![Value::Sint(2)]]);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unhandled_passes_through() {
        let mut chain = CommandChain::new();
        chain.push(CommandInterceptor::Trace);
        assert!(chain.try_handle(&statement()).is_none());
        assert!(CommandChain::new().try_handle(&statement()).is_none());
    }

    #[test]
    fn test_reentrant_call_is_suppressed() {
        let inner_result = Arc::new(std::sync::Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut chain = CommandChain::new();
        chain.push(CommandInterceptor::custom(Fixed {
            name: "fixed",
            value: 9,
            calls: calls.clone(),
        }));
        chain.push(CommandInterceptor::custom(Recursing {
            inner_result: inner_result.clone(),
        }));

        // The recursing interceptor's nested call sees nothing; the outer
        // call still falls through to the fixed interceptor.
        let result = chain.try_handle(&statement());
        assert_eq!(*inner_result.lock().unwrap(), Some(false));
        assert!(result.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Guard is released afterwards.
        assert!(chain.try_handle(&statement()).is_some());
    }

    #[test]
    fn test_exception_chain_folds_newest_first() {
        let mut chain = ExceptionChain::new();
        assert_eq!(chain.len(), 1);
        assert!(matches!(
            chain.transform(ClientError::Timeout),
            ClientError::Timeout
        ));

        chain.push(ExceptionInterceptor::custom(Prefix("a")));
        chain.push(ExceptionInterceptor::custom(Prefix("b")));

        let err = chain.transform(ClientError::Timeout);
        assert_eq!(
            err.to_string(),
            "configuration error: a:configuration error: b:request timeout"
        );
    }

    #[test]
    fn test_registry_builds_chains() {
        let mut registry = InterceptorRegistry::new();
        registry.register_exception("tag", || ExceptionInterceptor::custom(Prefix("tag")));

        let chain = registry.command_chain(&["Trace".to_string()]).unwrap();
        assert_eq!(chain.len(), 1);

        let chain = registry.exception_chain(&["tag".to_string()]).unwrap();
        assert_eq!(chain.len(), 2);

        assert!(matches!(
            registry.command_chain(&["missing".to_string()]),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            registry.exception_chain(&["missing".to_string()]),
            Err(ClientError::Config(_))
        ));
    }
}
