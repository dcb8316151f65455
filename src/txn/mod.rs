mod engine;
mod listener;
pub mod map;
mod redo;
mod transaction;
mod tvalue;
mod undo;

pub use engine::TransactionEngine;
pub use listener::{CountedListener, TransactionListener};
pub use map::TransactionMap;
pub use transaction::{IsolationLevel, Participant, Transaction, TxnEvent, TxnStatus};
pub use tvalue::{RowLock, TValue, Waiter};

pub type TxnId = u64;

/// Id of "no transaction"; cells with this owner are unlocked.
pub const TXN_NONE: TxnId = 0;
