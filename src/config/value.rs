use std::fmt;
use std::sync::Arc;

/// A configuration entry that is either a plain value or a zero-argument
/// function evaluated every time the value is read.
///
/// Nothing is memoised between reads; callers that need a stable value for
/// the duration of one operation resolve once and keep the result.
pub enum ConfigValue<T> {
    Value(T),
    Deferred(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> ConfigValue<T> {
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        ConfigValue::Deferred(Arc::new(f))
    }

    pub fn resolve(&self) -> T {
        match self {
            ConfigValue::Value(v) => v.clone(),
            ConfigValue::Deferred(f) => f(),
        }
    }
}

impl<T: Clone> Clone for ConfigValue<T> {
    fn clone(&self) -> Self {
        match self {
            ConfigValue::Value(v) => ConfigValue::Value(v.clone()),
            ConfigValue::Deferred(f) => ConfigValue::Deferred(Arc::clone(f)),
        }
    }
}

impl<T> From<T> for ConfigValue<T> {
    fn from(value: T) -> Self {
        ConfigValue::Value(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ConfigValue::Deferred(_) => f.write_str("Deferred(<fn>)"),
        }
    }
}
