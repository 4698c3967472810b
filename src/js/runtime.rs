use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Runtime, Value};
use thiserror::Error;

const MAX_JOBS: usize = 1000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },
    #[error("QuickJS failure: {0}")]
    QuickJs(#[from] JsError),
}

/// One QuickJS runtime and context. Each sandbox generation gets its own,
/// so dropping the engine releases every callback the script registered.
pub struct QuickJsEngine {
    context: Context,
    runtime: Runtime,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        Ok(Self { context, runtime })
    }

    /// Evaluate a script as a global program and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<(), EngineError> {
        let script = tag_source(source, filename);
        self.guarded(|ctx| ctx.eval::<(), _>(script))
    }

    /// Run `f` inside the context, turning a pending script exception into
    /// [`EngineError::Exception`], then drain promise jobs.
    pub fn guarded<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        let outcome = self.context.with(|ctx| {
            f(ctx.clone()).map_err(|err| match err {
                JsError::Exception => {
                    let (message, stack) = capture_exception(&ctx);
                    EngineError::Exception { message, stack }
                }
                other => EngineError::QuickJs(other),
            })
        });
        let drained = self.drain_jobs();
        if drained > 0 {
            tracing::trace!(target: "sandbox", drained, "promise jobs drained");
        }
        outcome
    }

    /// Run queued promise continuations, at most [`MAX_JOBS`] per call.
    fn drain_jobs(&self) -> usize {
        for drained in 0..MAX_JOBS {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => return drained,
                Err(err) => {
                    tracing::error!(target: "sandbox", error = ?err, "promise job failed");
                    return drained;
                }
            }
        }
        if self.runtime.is_job_pending() {
            tracing::warn!(
                target: "sandbox",
                limit = MAX_JOBS,
                "promise job queue not empty after drain limit; possible runaway microtasks"
            );
        }
        MAX_JOBS
    }

    /// Binding setup entry point; errors are plain `anyhow` failures.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context
            .with(f)
            .context("failed to run inside QuickJS context")
    }
}

/// Append a `sourceURL` pragma so stacks name the script.
fn tag_source(source: &str, filename: &str) -> Vec<u8> {
    let separator = if source.ends_with('\n') { "" } else { "\n" };
    format!("{source}{separator}//# sourceURL={filename}\n").into_bytes()
}

fn capture_exception(ctx: &Ctx<'_>) -> (String, Option<String>) {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            let stack = obj.get::<_, Option<String>>("stack").ok().flatten();
            return (message, stack);
        }
    }

    if let Some(text) = exception.as_string().and_then(|s| s.to_string().ok()) {
        return (text, None);
    }

    (format!("{:?}", exception), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quickjs_executes_script() {
        let engine = QuickJsEngine::new().expect("engine");
        let result: i32 = engine
            .guarded(|ctx| ctx.eval::<i32, _>("(() => 40 + 2)()"))
            .expect("script result");
        assert_eq!(result, 42);
    }

    #[test]
    fn exceptions_carry_message() {
        let engine = QuickJsEngine::new().expect("engine");
        let err = engine
            .eval("throw new TypeError('nope');", "throwing.js")
            .unwrap_err();
        match err {
            EngineError::Exception { message, .. } => assert_eq!(message, "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn promise_jobs_are_drained() {
        let engine = QuickJsEngine::new().expect("engine");
        engine
            .eval(
                "globalThis.done = false; Promise.resolve().then(() => { globalThis.done = true; });",
                "jobs.js",
            )
            .expect("eval");
        let done: bool = engine
            .guarded(|ctx| ctx.globals().get::<_, bool>("done"))
            .expect("read flag");
        assert!(done);
    }
}
