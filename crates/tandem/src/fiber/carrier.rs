//! Carrier threads and the baton hand-off
//!
//! Each non-root fiber's execution context lives on its own carrier thread,
//! which stays parked on the fiber's baton channel whenever the fiber is not
//! running. Switching sends the baton to the target and parks the sender, so
//! the fibers of one thread context never execute at the same time.

use super::{Baton, Fiber, FiberError, FiberState, Wake};
use crate::context::{self, ThreadContext};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Unwind payload used to tear down a parked fiber
struct Cancelled;

/// Spawn the carrier of a fiber that has never run
pub(super) fn ensure_started(ctx: &Arc<ThreadContext>, fiber: &Fiber) -> Result<(), FiberError> {
    if fiber.state() != FiberState::Created {
        return Ok(());
    }
    let mut carrier = fiber.inner.carrier.lock();
    if carrier.is_some() {
        return Ok(());
    }
    let Some(body) = fiber.inner.body.lock().take() else {
        return Err(FiberError::Dead(fiber.id()));
    };

    let name = match fiber.name() {
        Some(name) => format!("{}-{}", ctx.config().carrier_name_prefix, name),
        None => format!("{}-{}", ctx.config().carrier_name_prefix, fiber.id().as_u64()),
    };
    let mut builder = thread::Builder::new().name(name);
    if let Some(size) = fiber.inner.stack_size {
        builder = builder.stack_size(size);
    }

    let thread_ctx = Arc::clone(ctx);
    let thread_fiber = fiber.clone();
    let handle = builder
        .spawn(move || carrier_main(thread_ctx, thread_fiber, body))
        .map_err(|e| FiberError::Spawn(e.to_string()))?;
    *carrier = Some(handle);
    Ok(())
}

/// Hand control from `from` to `to` and park until control comes back
///
/// The caller has already moved `from` out of `Running`. Returns the value
/// `from` is woken with.
pub(super) fn switch(ctx: &ThreadContext, from: &Fiber, to: &Fiber, wake: Wake) -> Wake {
    to.set_state(FiberState::Running);
    ctx.set_current_fiber(to.clone());
    // Both ends of the channel live in `to`, so the send cannot fail
    let _ = to.inner.baton_tx.send(Baton::Wake(wake));
    wait_turn(from)
}

/// Park until the baton arrives; unwinds the fiber on cancellation
fn wait_turn(me: &Fiber) -> Wake {
    match me.inner.baton_rx.recv() {
        Ok(Baton::Wake(wake)) => wake,
        Ok(Baton::Cancel) | Err(_) => panic::resume_unwind(Box::new(Cancelled)),
    }
}

fn carrier_main(ctx: Arc<ThreadContext>, fiber: Fiber, body: super::FiberBody) {
    context::bind(Arc::clone(&ctx));

    // Park until the first resume
    match fiber.inner.baton_rx.recv() {
        Ok(Baton::Wake(_)) => {}
        Ok(Baton::Cancel) | Err(_) => {
            fiber.set_state(FiberState::Terminated);
            return;
        }
    }
    log::debug!("fiber {} started", fiber.id());

    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    fiber.set_state(FiberState::Terminated);
    fiber.set_waiting_in(None);

    match outcome {
        Ok(()) => log::debug!("fiber {} terminated", fiber.id()),
        Err(payload) if payload.is::<Cancelled>() => {
            // Cancelled from `ThreadContext::finish`; nobody is waiting for the baton
            log::debug!("fiber {} cancelled", fiber.id());
            return;
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::warn!("fiber {} panicked: {}", fiber.id(), message);
            *fiber.inner.failure.lock() = Some(FiberError::Panicked(message));
        }
    }

    let next = fiber
        .inner
        .resumer
        .lock()
        .take()
        .unwrap_or_else(|| ctx.root_fiber());
    next.set_state(FiberState::Running);
    ctx.set_current_fiber(next.clone());
    let _ = next.inner.baton_tx.send(Baton::Wake(Wake::Resume));
}

/// Unwind a parked fiber and join its carrier
pub(super) fn cancel(fiber: &Fiber) {
    match fiber.state() {
        FiberState::Running => return,
        FiberState::Created => {
            fiber.inner.body.lock().take();
            fiber.set_state(FiberState::Terminated);
        }
        FiberState::Suspended => {
            let _ = fiber.inner.baton_tx.send(Baton::Cancel);
        }
        FiberState::Terminated => {}
    }
    let carrier = fiber.inner.carrier.lock().take();
    if let Some(handle) = carrier {
        let _ = handle.join();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
