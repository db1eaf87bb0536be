//! Virtual address allocation.
//!
//! Addresses look like dotted quads with six components. Component `i` is
//! `(ordinal / 256^i) % 256`, i.e. the low six bytes of the ordinal written
//! least-significant first.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{Advance, CounterStore, StoreError};

/// Number of components in a virtual address.
pub const COMPONENTS: usize = 6;

/// Number of distinct addresses, 256^6.
pub const ADDRESS_SPACE: u64 = 1 << (8 * COMPONENTS);

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("failed to persist ordinal: {0}")]
    Store(#[from] StoreError),

    #[error("address space exhausted")]
    Exhausted,
}

#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Allocates a fresh address. The address is only returned once the
    /// advanced counter has been persisted.
    async fn next(&self) -> Result<String, AllocatorError>;
}

/// Formats an ordinal as a six-component address. Only the low 48 bits
/// contribute.
pub fn format_address(ordinal: u64) -> String {
    ordinal.to_le_bytes()[..COMPONENTS]
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Allocator driven by a persistent monotonic counter.
pub struct VirtualAddressAllocator {
    counter: Arc<dyn CounterStore>,
}

impl VirtualAddressAllocator {
    pub fn new(counter: Arc<dyn CounterStore>) -> Self {
        Self { counter }
    }
}

/// Unreadable counters count as zero.
fn advance_ordinal(read: Result<u64, StoreError>) -> Advance {
    let ordinal = match read {
        Ok(ordinal) => ordinal,
        Err(StoreError::NotFound(_)) => 0,
        Err(e) => {
            warn!("Failed to read ordinal, starting from 0: {}", e);
            0
        }
    };

    if ordinal >= ADDRESS_SPACE {
        Advance::Hold
    } else {
        Advance::To(ordinal + 1)
    }
}

#[async_trait]
impl AddressAllocator for VirtualAddressAllocator {
    async fn next(&self) -> Result<String, AllocatorError> {
        match self.counter.advance(&advance_ordinal).await? {
            Some(next) => {
                let address = format_address(next - 1);
                debug!("Allocated address {} (ordinal {})", address, next - 1);
                Ok(address)
            }
            None => {
                warn!("Address space exhausted");
                Err(AllocatorError::Exhausted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AdvanceStep, MemoryStore};
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Counter whose reads or writes can be made to fail.
    struct FlakyCounter {
        inner: MemoryStore,
        fail_reads: bool,
        fail_writes: bool,
    }

    #[async_trait]
    impl CounterStore for FlakyCounter {
        async fn advance(&self, step: AdvanceStep<'_>) -> Result<Option<u64>, StoreError> {
            let read = if self.fail_reads {
                Err(StoreError::OperationFailed("read timeout".into()))
            } else {
                self.inner
                    .ordinal()
                    .await
                    .ok_or_else(|| StoreError::NotFound("ordinal".into()))
            };

            match step(read) {
                Advance::Hold => Ok(None),
                Advance::To(_) if self.fail_writes => {
                    Err(StoreError::OperationFailed("write rejected".into()))
                }
                Advance::To(next) => self.inner.advance(&|_| Advance::To(next)).await,
            }
        }
    }

    #[test]
    fn test_format_known_values() {
        assert_eq!(format_address(0), "0.0.0.0.0.0");
        assert_eq!(format_address(1), "1.0.0.0.0.0");
        assert_eq!(format_address(255), "255.0.0.0.0.0");
        assert_eq!(format_address(256), "0.1.0.0.0.0");
        assert_eq!(format_address(0x0102_0304_0506), "6.5.4.3.2.1");
        assert_eq!(format_address(ADDRESS_SPACE - 1), "255.255.255.255.255.255");
    }

    #[tokio::test]
    async fn test_sequential_allocation_from_fresh_counter() {
        let store = Arc::new(MemoryStore::new());
        let allocator = VirtualAddressAllocator::new(store.clone());

        assert_eq!(allocator.next().await.unwrap(), "0.0.0.0.0.0");
        assert_eq!(allocator.next().await.unwrap(), "1.0.0.0.0.0");
        assert_eq!(store.ordinal().await, Some(2));
    }

    #[tokio::test]
    async fn test_resumes_from_stored_ordinal() {
        let store = Arc::new(MemoryStore::with_ordinal(5));
        let allocator = VirtualAddressAllocator::new(store.clone());
        assert_eq!(allocator.next().await.unwrap(), "5.0.0.0.0.0");
        assert_eq!(store.ordinal().await, Some(6));
    }

    #[tokio::test]
    async fn test_read_failure_counts_as_zero() {
        let counter = Arc::new(FlakyCounter {
            inner: MemoryStore::with_ordinal(77),
            fail_reads: true,
            fail_writes: false,
        });
        let allocator = VirtualAddressAllocator::new(counter.clone());
        assert_eq!(allocator.next().await.unwrap(), "0.0.0.0.0.0");
        assert_eq!(counter.inner.ordinal().await, Some(1));
    }

    #[tokio::test]
    async fn test_write_failure_discards_address() {
        let counter = Arc::new(FlakyCounter {
            inner: MemoryStore::with_ordinal(3),
            fail_reads: false,
            fail_writes: true,
        });
        let allocator = VirtualAddressAllocator::new(counter.clone());
        assert!(matches!(allocator.next().await, Err(AllocatorError::Store(_))));
        assert_eq!(counter.inner.ordinal().await, Some(3));
    }

    #[tokio::test]
    async fn test_exhausted_space_is_rejected_without_persisting() {
        let store = Arc::new(MemoryStore::with_ordinal(ADDRESS_SPACE - 1));
        let allocator = VirtualAddressAllocator::new(store.clone());

        assert_eq!(allocator.next().await.unwrap(), "255.255.255.255.255.255");
        assert!(matches!(allocator.next().await, Err(AllocatorError::Exhausted)));
        assert_eq!(store.ordinal().await, Some(ADDRESS_SPACE));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let store = Arc::new(MemoryStore::new());
        let allocator = Arc::new(VirtualAddressAllocator::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move { allocator.next().await.unwrap() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(store.ordinal().await, Some(64));
    }

    proptest! {
        #[test]
        fn prop_six_components_in_range(ordinal in 0..ADDRESS_SPACE) {
            let address = format_address(ordinal);
            let parts: Vec<&str> = address.split('.').collect();
            prop_assert_eq!(parts.len(), COMPONENTS);
            for part in parts {
                let value: u16 = part.parse().unwrap();
                prop_assert!(value <= 255);
            }
        }

        #[test]
        fn prop_injective(a in 0..ADDRESS_SPACE, b in 0..ADDRESS_SPACE) {
            prop_assume!(a != b);
            prop_assert_ne!(format_address(a), format_address(b));
        }

        #[test]
        fn prop_components_are_base_256_digits(ordinal in 0..ADDRESS_SPACE) {
            let rebuilt = format_address(ordinal)
                .split('.')
                .enumerate()
                .map(|(i, part)| part.parse::<u64>().unwrap() << (8 * i))
                .sum::<u64>();
            prop_assert_eq!(rebuilt, ordinal);
        }
    }
}
