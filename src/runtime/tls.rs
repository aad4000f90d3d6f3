//! Thread local storage for the coroutine registry.
//!
//! Keeping the registry in TLS instead of a process-wide static means each
//! thread is an independent execution context with its own caller slot.

use std::cell::RefCell;

thread_local! {
    /// Each thread gets its own independent registry, created on first use.
    static REGISTRY: RefCell<Option<super::RegistryState>> = const { RefCell::new(None) };
}

/// Borrow the calling thread's registry.
///
/// The borrow lasts only for the closure; callers that need to context
/// switch extract raw pointers inside the closure and swap after it returns,
/// so no borrow is ever held across a suspension point.
pub(super) fn registry<T>(f: impl FnOnce(&mut super::RegistryState) -> T) -> T {
    REGISTRY.with(|cell| {
        let mut slot = cell.borrow_mut();
        let registry = slot.get_or_insert_with(super::RegistryState::new);
        f(registry)
    })
}
