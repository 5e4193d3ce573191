//! External validity of proposed values.

use tessera_types::Value;

/// Decides whether a proposed value may be prepared.
///
/// Must be deterministic: every correct replica has to reach the same
/// verdict for the same bytes, or a correct leader's proposal can stall.
pub trait ValueValidator: Send + Sync + 'static {
    fn is_valid(&self, value: &Value) -> bool;
}

/// Accepts every value.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ValueValidator for AcceptAll {
    fn is_valid(&self, _value: &Value) -> bool {
        true
    }
}

impl<F> ValueValidator for F
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    fn is_valid(&self, value: &Value) -> bool {
        self(value)
    }
}
