//! Coroutine lifecycle built on top of the context primitive.
//!
//! A coroutine is created suspended, alternates between running and
//! suspended as [`resume`] and [`yield_value`] exchange control, becomes
//! permanently finished through [`exit`] (explicit, or implicit when the
//! entry function returns or panics), and is destroyed once it is
//! guaranteed inactive.

use std::marker::PhantomData;
use std::{fmt, hint, panic};

mod arch;
mod stack;
mod tls;

/// Sentinel returned by [`resume`] for a coroutine that has already
/// finished.
///
/// A coroutine that exits with this value is indistinguishable from a
/// finished one, exactly like a process exiting with an error code that
/// collides with a convention.
pub const FINISHED: i64 = -1;

/// A coroutine entry function. Receives the coroutine's own handle and
/// cooperates by calling [`yield_value`] and [`exit`] with it.
pub type EntryFn = fn(Coroutine);

/// Handle to a coroutine.
///
/// Plain copyable identity into the creating thread's registry; it is
/// meaningless on any other thread.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Coroutine(usize, PhantomData<*const ()>);

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Coroutine").field(&self.0).finish()
    }
}

/// One coroutine record: its stack and context live exactly as long as the
/// record does, and are never shared with another coroutine.
struct CoroutineState {
    stack: stack::Stack,
    context: arch::RegisterFile,
    entry: EntryFn,
    last_value: i64,
    is_finished: bool,
}

/// Per-thread registry: the coroutine records plus the single caller slot.
///
/// "Which context is currently active" lives here rather than in a
/// process-wide static, so every thread is an independent execution context.
struct RegistryState {
    coroutines: slab::Slab<CoroutineState>,
    running: Option<Coroutine>,
    caller: arch::RegisterFile,
}

impl RegistryState {
    fn new() -> Self {
        RegistryState {
            coroutines: slab::Slab::new(),
            running: None,
            caller: arch::RegisterFile::new(),
        }
    }
}

/// Creates a suspended coroutine that will run `entry` on its own
/// guard-paged stack of at least `stack_size` usable bytes.
///
/// The entry function receives the coroutine's own handle as its single
/// argument. Fails only if the stack cannot be mapped; no partial state is
/// left behind on failure.
pub fn create(entry: EntryFn, stack_size: usize) -> Result<Coroutine, crate::Error> {
    let stack = stack::Stack::new(stack_size)?;

    // seed the snapshot from the creator, as a capture-then-make sequence;
    // initialize overwrites every slot the fresh context depends on
    let mut context = arch::RegisterFile::new();
    unsafe { arch::capture(&mut context) };

    let coro = tls::registry(|registry| {
        let index = registry.coroutines.insert(CoroutineState {
            stack,
            context,
            entry,
            last_value: 0,
            is_finished: false,
        });

        let state = &mut registry.coroutines[index];
        unsafe {
            arch::initialize(
                &mut state.context,
                state.stack.base(),
                entry_trampoline as usize,
                index,
            )
        };

        Coroutine(index, PhantomData)
    });

    log::trace!("created {:?} ({} byte stack requested)", coro, stack_size);
    Ok(coro)
}

/// Resumes a suspended coroutine and blocks until it yields or finishes,
/// returning the value it published.
///
/// Returns [`FINISHED`] without touching any machine state if the coroutine
/// has already finished.
///
/// # Panics
/// If called from inside a coroutine, or with a destroyed handle.
pub fn resume(coro: Coroutine) -> i64 {
    let target = tls::registry(|registry| {
        assert!(
            registry.running.is_none(),
            "resume called from inside a coroutine"
        );

        let state = &registry.coroutines[coro.0];
        if state.is_finished {
            return None;
        }

        log::trace!(
            "resuming {:?} at {:#x}",
            coro,
            state.context.instruction_pointer()
        );
        registry.running = Some(coro);

        Some((
            &mut registry.caller as *mut arch::RegisterFile,
            &state.context as *const arch::RegisterFile,
        ))
    });

    let Some((caller, context)) = target else {
        return FINISHED;
    };

    // no borrow is held across the suspension
    unsafe { arch::swap(caller, context) };

    tls::registry(|registry| {
        registry.running = None;
        registry.coroutines[coro.0].last_value
    })
}

/// Publishes `value` and suspends the coroutine, returning control to
/// whoever resumed it.
///
/// Callable only from inside the coroutine's own execution. From the
/// coroutine's point of view this is an ordinary call that returns — with
/// the currently published value — once the caller resumes it again.
///
/// # Panics
/// If `coro` is not the currently running coroutine.
pub fn yield_value(coro: Coroutine, value: i64) -> i64 {
    let (context, caller) = tls::registry(|registry| {
        assert_eq!(
            registry.running,
            Some(coro),
            "yield called outside the coroutine"
        );

        let state = &mut registry.coroutines[coro.0];
        state.last_value = value;

        (
            &mut state.context as *mut arch::RegisterFile,
            &registry.caller as *const arch::RegisterFile,
        )
    });

    unsafe { arch::swap(context, caller) };

    // resumed: stack and locals are exactly as they were
    tls::registry(|registry| registry.coroutines[coro.0].last_value)
}

/// Marks the coroutine finished, publishes `value`, and suspends it for
/// good; the body is never entered again. Idempotent: on an already
/// finished coroutine this returns the stored terminal value with no other
/// effect.
///
/// An entry function that returns normally is treated exactly like an
/// explicit exit with an unspecified value.
pub fn exit(coro: Coroutine, value: i64) -> i64 {
    let caller = tls::registry(|registry| {
        let state = &mut registry.coroutines[coro.0];
        if state.is_finished {
            return Err(state.last_value);
        }

        assert_eq!(
            registry.running,
            Some(coro),
            "exit called outside the coroutine"
        );
        state.is_finished = true;
        state.last_value = value;

        Ok(&registry.caller as *const arch::RegisterFile)
    });

    match caller {
        Err(stored) => stored,
        Ok(caller) => {
            log::trace!("{:?} finished with {}", coro, value);
            // a finished context is never captured again: install the
            // caller directly instead of swapping
            unsafe { arch::install(caller) }
        }
    }
}

/// Releases the coroutine's stack and record.
///
/// # Panics
/// If `coro` is currently running, or was already destroyed.
pub fn destroy(coro: Coroutine) {
    let state = tls::registry(|registry| {
        assert_ne!(
            registry.running,
            Some(coro),
            "cannot destroy the running coroutine"
        );
        registry.coroutines.remove(coro.0)
    });

    drop(state); // unmaps the stack
    log::trace!("destroyed {:?}", coro);
}

/// First frame of every coroutine: looks up the registered entry, runs it,
/// and converts a normal return or a panic into an implicit exit. Unwinding
/// never crosses the context switch boundary.
extern "C" fn entry_trampoline(index: usize) {
    let coro = Coroutine(index, PhantomData);
    let entry = tls::registry(|registry| registry.coroutines[coro.0].entry);

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| entry(coro)));
    hint::black_box(&result); // removing this causes a segfault in release mode

    // entry came back without exiting; finish with an unspecified value
    exit(coro, 0);
    unreachable!("a finished coroutine was re-entered");
}

/// Defensive trap for an entry frame that unwound past the trampoline.
///
/// The trampoline terminates every coroutine, so the synthetic return slot
/// it sits behind is unreachable by construction; if it is reached anyway,
/// the event is treated as an implicit exit, never as undefined behavior.
pub(crate) extern "C" fn entry_fallthrough() -> ! {
    let coro = tls::registry(|registry| {
        registry
            .running
            .expect("fallthrough trap reached with no coroutine running")
    });
    exit(coro, 0);
    unreachable!("a finished coroutine was re-entered");
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::thread;

    use super::*;

    const STACK_SIZE: usize = 64 * 1024;

    fn one_two_then_zero(coro: Coroutine) {
        yield_value(coro, 1);
        yield_value(coro, 2);
        exit(coro, 0);
    }

    mod create {
        use super::*;

        thread_local! {
            static RAN: Cell<bool> = const { Cell::new(false) };
        }

        fn marks_ran(coro: Coroutine) {
            RAN.with(|cell| cell.set(true));
            exit(coro, 0);
        }

        #[test]
        fn then_destroy_never_runs_entry() {
            let coro = create(marks_ran, STACK_SIZE).unwrap();

            destroy(coro);

            assert!(!RAN.with(|cell| cell.get()));
        }

        #[test]
        fn tiny_stack_request_is_rounded_up() {
            // 1 usable byte still becomes a full page, enough to run on
            let coro = create(one_two_then_zero, 1).unwrap();

            assert_eq!(resume(coro), 1);
            assert_eq!(resume(coro), 2);
            assert_eq!(resume(coro), 0);
            destroy(coro);
        }

        #[test]
        fn handle_implements_traits() {
            use impls::impls;
            use std::fmt::Debug;

            assert!(impls!(Coroutine: Debug & Copy & !Send & !Sync));
        }
    }

    mod resume {
        use super::*;

        thread_local! {
            static EXPECTED: Cell<usize> = const { Cell::new(usize::MAX) };
        }

        fn checks_own_handle(coro: Coroutine) {
            let matches = EXPECTED.with(|cell| cell.get()) == coro.0;
            exit(coro, matches as i64);
        }

        #[test]
        fn begins_entry_with_its_own_handle() {
            let coro = create(checks_own_handle, STACK_SIZE).unwrap();
            EXPECTED.with(|cell| cell.set(coro.0));

            assert_eq!(resume(coro), 1);
            destroy(coro);
        }

        #[test]
        fn returns_each_published_value_in_order() {
            let coro = create(one_two_then_zero, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), 1);
            assert_eq!(resume(coro), 2);
            assert_eq!(resume(coro), 0);
            assert_eq!(resume(coro), FINISHED);
            assert_eq!(resume(coro), FINISHED);
            destroy(coro);
        }

        fn echoes_extremes(coro: Coroutine) {
            yield_value(coro, i64::MIN);
            yield_value(coro, i64::MAX);
            yield_value(coro, 0);
            exit(coro, -42);
        }

        #[test]
        fn round_trips_values_exactly() {
            let coro = create(echoes_extremes, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), i64::MIN);
            assert_eq!(resume(coro), i64::MAX);
            assert_eq!(resume(coro), 0);
            assert_eq!(resume(coro), -42);
            destroy(coro);
        }

        fn formats_its_handle(coro: Coroutine) {
            // a nested call that touches the heap and vector paths faults
            // if the entry stack pointer missed the call alignment
            let text = format!("{:?}", coro);
            let length = text.len() as i64;
            drop(text);
            exit(coro, length);
        }

        #[test]
        fn entry_stack_supports_nested_calls() {
            let coro = create(formats_its_handle, STACK_SIZE).unwrap();

            assert!(resume(coro) > 0);
            destroy(coro);
        }

        fn counts_from_100(coro: Coroutine) {
            let mut local = 100;
            loop {
                local += 1;
                yield_value(coro, local);
            }
        }

        fn counts_from_200(coro: Coroutine) {
            let mut local = 200;
            loop {
                local += 1;
                yield_value(coro, local);
            }
        }

        #[test]
        fn interleaved_coroutines_keep_their_own_state() {
            let a = create(counts_from_100, STACK_SIZE).unwrap();
            let b = create(counts_from_200, STACK_SIZE).unwrap();

            assert_eq!(resume(a), 101);
            assert_eq!(resume(b), 201);
            assert_eq!(resume(a), 102);
            assert_eq!(resume(b), 202);
            assert_eq!(resume(a), 103);

            destroy(a);
            destroy(b);
        }

        fn resumes_itself(coro: Coroutine) {
            resume(coro);
        }

        #[test]
        fn from_inside_a_coroutine_is_rejected() {
            let coro = create(resumes_itself, STACK_SIZE).unwrap();

            // the rejection panic unwinds to the trampoline, which finishes
            // the coroutine instead of corrupting the caller slot
            let terminal = resume(coro);

            assert_ne!(terminal, FINISHED);
            assert_eq!(resume(coro), FINISHED);
            destroy(coro);
        }

        #[test]
        #[should_panic]
        fn destroyed_handle_is_rejected() {
            let coro = create(one_two_then_zero, STACK_SIZE).unwrap();
            destroy(coro);

            resume(coro);
        }

        #[test]
        fn works_in_parallel_threads() {
            let other = thread::spawn(|| {
                let coro = create(one_two_then_zero, STACK_SIZE).unwrap();
                assert_eq!(resume(coro), 1);
                assert_eq!(resume(coro), 2);
                assert_eq!(resume(coro), 0);
                destroy(coro);
            });

            let coro = create(one_two_then_zero, STACK_SIZE).unwrap();
            assert_eq!(resume(coro), 1);
            assert_eq!(resume(coro), 2);
            assert_eq!(resume(coro), 0);
            destroy(coro);

            other.join().unwrap();
        }
    }

    mod exit {
        use super::*;

        fn exits_with_five(coro: Coroutine) {
            exit(coro, 5);
        }

        #[test]
        fn is_idempotent() {
            let coro = create(exits_with_five, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), 5);
            // second exit has no effect and reports the terminal value
            assert_eq!(exit(coro, 99), 5);
            assert_eq!(resume(coro), FINISHED);
            destroy(coro);
        }

        fn falls_through(coro: Coroutine) {
            yield_value(coro, 1);
        }

        #[test]
        fn entry_returning_normally_counts_as_exit() {
            let coro = create(falls_through, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), 1);
            let terminal = resume(coro);

            assert_ne!(terminal, FINISHED);
            assert_eq!(resume(coro), FINISHED);
            destroy(coro);
        }

        fn panics_after_one(coro: Coroutine) {
            yield_value(coro, 1);
            panic!("entry blew up");
        }

        #[test]
        fn panicking_entry_counts_as_exit() {
            let coro = create(panics_after_one, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), 1);
            let terminal = resume(coro);

            assert_ne!(terminal, FINISHED);
            assert_eq!(resume(coro), FINISHED);
            destroy(coro);
        }
    }

    mod destroy {
        use super::*;

        #[test]
        fn suspended_coroutine_is_destroyable() {
            let coro = create(one_two_then_zero, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), 1);

            // suspended mid-body, never finished
            destroy(coro);
        }

        fn destroys_itself(coro: Coroutine) {
            destroy(coro);
        }

        #[test]
        fn from_inside_the_coroutine_is_rejected() {
            let coro = create(destroys_itself, STACK_SIZE).unwrap();

            // the rejection panic finishes the coroutine; the record stays
            // intact and destroyable from outside
            let terminal = resume(coro);

            assert_ne!(terminal, FINISHED);
            assert_eq!(resume(coro), FINISHED);
            destroy(coro);
        }

        #[test]
        #[should_panic]
        fn twice_is_rejected() {
            let coro = create(one_two_then_zero, STACK_SIZE).unwrap();

            destroy(coro);
            destroy(coro);
        }
    }

    mod yield_value {
        use super::*;

        fn yields_once(coro: Coroutine) {
            yield_value(coro, 7);
            exit(coro, 8);
        }

        #[test]
        #[should_panic]
        fn from_outside_a_coroutine_is_rejected() {
            let coro = create(yields_once, STACK_SIZE).unwrap();

            yield_value(coro, 1);
        }

        #[test]
        fn suspends_until_the_next_resume() {
            let coro = create(yields_once, STACK_SIZE).unwrap();

            assert_eq!(resume(coro), 7);
            assert_eq!(resume(coro), 8);
            destroy(coro);
        }
    }
}
