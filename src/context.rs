use std::cell::RefCell;
use std::future::Future;

use crate::record::{clip, REMOTE_ADDRESS_MAX};

tokio::task_local! {
    static TASK_REMOTE_ADDRESS: String;
}

thread_local! {
    static THREAD_REMOTE_ADDRESS: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Remote address of the request currently being served.
///
/// Async request handling sets it per task, blocking work sets it per thread. Code
/// outside of any request sees no address.
pub struct RequestContext;

impl RequestContext {
    /// Runs `fut` with `remote_address` as the current request's origin.
    pub async fn scope_async<F>(remote_address: String, fut: F) -> F::Output
    where
        F: Future,
    {
        TASK_REMOTE_ADDRESS.scope(remote_address, fut).await
    }

    /// Runs `func` on the current thread with `remote_address` as the current
    /// request's origin. The previous value is restored afterwards.
    pub fn scope<F, R>(remote_address: Option<String>, func: F) -> R
    where
        F: FnOnce() -> R,
    {
        let previous =
            THREAD_REMOTE_ADDRESS.with(|cell| cell.replace(remote_address));
        let _restore = Restore(previous);
        func()
    }

    pub fn remote_address() -> Option<String> {
        if let Ok(addr) = TASK_REMOTE_ADDRESS.try_with(|addr| addr.clone()) {
            return Some(addr);
        }

        THREAD_REMOTE_ADDRESS.with(|cell| cell.borrow().clone())
    }

    /// The value persisted in the address column: empty when there is no request.
    pub fn remote_address_column() -> String {
        clip(Self::remote_address().unwrap_or_default(), REMOTE_ADDRESS_MAX)
    }
}

struct Restore(Option<String>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        THREAD_REMOTE_ADDRESS.with(|cell| {
            *cell.borrow_mut() = previous;
        });
    }
}
