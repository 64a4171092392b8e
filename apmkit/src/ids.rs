//! Transaction id generation
#[cfg(feature = "testing")]
pub use increment::IncrementIdGenerator;

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

/// A 16-byte value which identifies a recorded transaction.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct TransactionId(u128);

impl TransactionId {
    /// Invalid transaction id
    pub const INVALID: TransactionId = TransactionId(0);

    /// Create a transaction id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TransactionId(u128::from_be_bytes(bytes))
    }

    /// Return the representation of this transaction id as a byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl From<u128> for TransactionId {
    fn from(value: u128) -> Self {
        TransactionId(value)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Interface for generating transaction IDs
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TransactionId`
    fn new_transaction_id(&self) -> TransactionId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates transaction ids using a random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_transaction_id(&self) -> TransactionId {
        CURRENT_RNG.with(|rng| TransactionId::from(rng.borrow_mut().random::<u128>()))
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

#[cfg(feature = "testing")]
mod increment {
    use crate::ids::{IdGenerator, TransactionId};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    /// [`IdGenerator`] implementation that increments a counter for each new ID. This helps produce
    /// predictable IDs for testing.
    #[derive(Clone, Debug)]
    pub struct IncrementIdGenerator(Arc<AtomicU64>);

    impl IncrementIdGenerator {
        /// Create a new [`IncrementIdGenerator`]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Default for IncrementIdGenerator {
        fn default() -> Self {
            Self(Arc::new(AtomicU64::new(1)))
        }
    }

    impl IdGenerator for IncrementIdGenerator {
        fn new_transaction_id(&self) -> TransactionId {
            TransactionId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u128)
        }
    }
}
