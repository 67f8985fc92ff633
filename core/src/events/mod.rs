mod signal;

pub use signal::PresenceSignal;

use crate::context::Context;
use crate::error::EffectError;

/// Consumer of presence signals.
///
/// Implemented by `EffectHandler` (acts only on signals for its own owner) and
/// by `EffectEngine` (routes to the owner's handler).
pub trait SignalHandler {
    fn handle_signal(&mut self, signal: &PresenceSignal, ctx: &mut Context) -> Result<(), EffectError>;

    /// Process signals in order, stopping at the first error
    fn handle_signals(&mut self, signals: &[PresenceSignal], ctx: &mut Context) -> Result<(), EffectError> {
        for signal in signals {
            self.handle_signal(signal, ctx)?;
        }
        Ok(())
    }
}
