//! Locks used by the VM layer.
//!
//! Every lock here spins; none of them may be held across a context switch.
//! Lock order, outermost first:
//!
//! 1. an address space's fault lock,
//! 2. the frame table,
//! 3. any supplemental page table,
//! 4. a user page's contents,
//! 5. the swap bitmap or the swap device, or a file's own lock.
//!
//! Locks in level 5 are leaves and are never held while taking another.

#[cfg(feature = "ticket_mutex")]
pub type Mutex<T> = spin::mutex::TicketMutex<T>;
#[cfg(feature = "ticket_mutex")]
pub type MutexGuard<'a, T> = spin::mutex::TicketMutexGuard<'a, T>;

#[cfg(not(feature = "ticket_mutex"))]
pub type Mutex<T> = spin::mutex::SpinMutex<T>;
#[cfg(not(feature = "ticket_mutex"))]
pub type MutexGuard<'a, T> = spin::mutex::SpinMutexGuard<'a, T>;
