//! Panic hook (§5): the engine is single-threaded within a process and
//! holds no cross-process mutex over its on-disk state, so a panic mid
//! transaction is safer handled by aborting than by unwinding into
//! whatever caller invoked the engine next.

use backtrace::Backtrace;
use std::{
    panic::{self, PanicHookInfo},
    process, thread,
};

/// Installs a hook that logs a backtrace through the `log` facade, then
/// aborts the process.
pub fn set_abort() {
    set_with(|msg| {
        log::error!("{msg}");
        process::abort()
    });
}

/// Installs a hook with a caller-supplied closure receiving the formatted
/// panic message. Panicking again inside the closure double-panics and
/// stops the process.
pub fn set_with<F>(f: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    panic::set_hook(Box::new(move |info| {
        f(&format_panic(info));
    }));
}

static REPORT_NOTE: &str = "\nThis is a bug in the storage engine. Please include this backtrace in your report.\n";

fn format_panic(info: &PanicHookInfo) -> String {
    let location = info.location();
    let file = location.as_ref().map(|l| l.file()).unwrap_or("<unknown>");
    let line = location.as_ref().map(|l| l.line()).unwrap_or(0);

    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "Box<Any>",
        },
    };

    let thread = thread::current();
    let name = thread.name().unwrap_or("<unnamed>");
    let backtrace = Backtrace::new();

    format!(
        "\n====================\n\n{backtrace:?}\n\nthread '{name}' panicked at '{msg}', {file}:{line}\n{REPORT_NOTE}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn set_with_invokes_closure_on_panic() {
        let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();
        let previous = panic::take_hook();
        set_with(move |msg| {
            *captured_clone.lock().unwrap() = Some(msg.to_string());
        });

        let result = panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());
        assert!(captured.lock().unwrap().as_ref().unwrap().contains("boom"));

        panic::set_hook(previous);
    }
}
