// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Global byte budget shared by every batch that has not reached a terminal outcome.
//!
//! The guard is a semaphore holding one permit per byte of budget. A
//! [`Reservation`] owns the bytes it acquired and gives them back when it is
//! dropped, so a batch releases its quota exactly once: when the batch itself
//! is dropped at the end of its terminal transition.

use crate::errors::ProducerError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, warn};

pub struct MemoryGuard {
    semaphore: Arc<Semaphore>,
    budget: usize,
}

/// Outcome of a successful [`MemoryGuard::reserve`].
#[derive(Debug)]
pub struct Admission {
    pub reservation: Reservation,
    /// Time spent blocked, `None` when the bytes were available immediately.
    pub waited: Option<Duration>,
}

impl MemoryGuard {
    pub fn new(budget: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(budget)),
            budget,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes currently held by outstanding reservations.
    pub fn reserved(&self) -> usize {
        self.budget
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Blocks until `bytes` fit in the budget or `max_wait` elapses.
    ///
    /// `max_wait` of `None` waits without a deadline, `Some(Duration::ZERO)` never waits.
    pub async fn reserve(
        &self,
        bytes: usize,
        max_wait: Option<Duration>,
    ) -> Result<Admission, ProducerError> {
        if bytes > self.budget {
            warn!(
                "PRODUCER | Record of {bytes} bytes can never fit in the {} byte budget",
                self.budget
            );
            return Err(ProducerError::QuotaExceeded {
                requested: bytes,
                waited: Duration::ZERO,
            });
        }
        let permits = u32::try_from(bytes).map_err(|_| ProducerError::QuotaExceeded {
            requested: bytes,
            waited: Duration::ZERO,
        })?;

        match self.semaphore.try_acquire_many(permits) {
            Ok(permit) => {
                permit.forget();
                return Ok(Admission {
                    reservation: self.reservation(bytes),
                    waited: None,
                });
            }
            Err(TryAcquireError::Closed) => return Err(ProducerError::Shutdown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let start = Instant::now();
        let acquire = self.semaphore.acquire_many(permits);
        let acquired = match max_wait {
            None => acquire.await,
            Some(limit) if limit.is_zero() => {
                return Err(ProducerError::QuotaExceeded {
                    requested: bytes,
                    waited: Duration::ZERO,
                })
            }
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    return Err(ProducerError::QuotaExceeded {
                        requested: bytes,
                        waited: start.elapsed(),
                    })
                }
            },
        };
        let permit = acquired.map_err(|_| ProducerError::Shutdown)?;
        permit.forget();

        let waited = start.elapsed();
        debug!("PRODUCER | Waited {} ms for {bytes} bytes of memory", waited.as_millis());
        Ok(Admission {
            reservation: self.reservation(bytes),
            waited: Some(waited),
        })
    }

    fn reservation(&self, bytes: usize) -> Reservation {
        Reservation {
            semaphore: Arc::clone(&self.semaphore),
            bytes,
        }
    }
}

impl fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("budget", &self.budget)
            .field("reserved", &self.reserved())
            .finish()
    }
}

/// Bytes held against the budget. Released on drop.
#[must_use = "dropping a reservation releases its bytes immediately"]
pub struct Reservation {
    semaphore: Arc<Semaphore>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Moves the bytes of `other` into `self`; `other` releases nothing afterwards.
    pub fn absorb(&mut self, mut other: Reservation) {
        debug_assert!(Arc::ptr_eq(&self.semaphore, &other.semaphore));
        self.bytes += std::mem::take(&mut other.bytes);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.semaphore.add_permits(self.bytes);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("bytes", &self.bytes)
            .finish()
    }
}
