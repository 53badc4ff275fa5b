use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

/// Progress bar style of the task-graph root span.
pub(crate) fn get_style_graph() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Runs user code, turning a panic into an error.
///
/// We use AssertUnwindSafe because the callers only hand over state they own
/// or state guarded by locks that are never held across user code.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(panic_message(panic.as_ref()))),
    }
}

/// Runs a job whose failure has nowhere to go but the log.
pub(crate) fn run_logged(job: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!("{}", panic_message(panic.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_panic_str() {
        let result: anyhow::Result<()> = catch_panic(|| panic!("boom"));
        assert_eq!(result.unwrap_err().to_string(), "Task panicked: boom");
    }

    #[test]
    fn test_catch_panic_passes_result() {
        assert_eq!(catch_panic(|| Ok(5)).unwrap(), 5);
    }

    #[test]
    fn test_graph_style() {
        assert!(get_style_graph().is_ok());
    }
}
