//! Script verification contract and reference interpreter.

pub mod interpreter;

pub use interpreter::{verify_script, Interpreter, ScriptError};

use keeld_consensus::ForkFlags;
use keeld_primitives::Transaction;

/// Contract the connect stage validates inputs against.
///
/// The production interpreter is an external collaborator; anything
/// satisfying this trait can be plugged into the validator.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prevout_script: &[u8],
        value: i64,
        flags: ForkFlags,
    ) -> Result<(), ScriptError>;
}
