//! OS threads that finish their scheduling context on exit

use crate::context;
use crate::error::Result;
use std::io;
use std::thread::{Builder, JoinHandle};

/// Spawn a thread running `f`, then its scheduler's `run()` hook
///
/// Once `f` returns, the thread's context is finished: an installed
/// scheduler drives its remaining fibers to completion, is uninstalled, and
/// fibers still suspended are cancelled. The handle yields `f`'s value, or
/// the error returned by `run()`.
pub fn spawn<F, T>(f: F) -> io::Result<JoinHandle<Result<T>>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_with(Builder::new(), f)
}

/// Like [`spawn`], with the thread named `name`
pub fn spawn_named<F, T>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<Result<T>>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_with(Builder::new().name(name.into()), f)
}

fn spawn_with<F, T>(builder: Builder, f: F) -> io::Result<JoinHandle<Result<T>>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    builder.spawn(move || {
        let value = f();
        context::finish()?;
        Ok(value)
    })
}
