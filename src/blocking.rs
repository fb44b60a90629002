//! Blocking access to the store, for callers that do not run an async runtime.
//!
//! [`BlockingContext`] owns a tokio runtime and a [`Context`] living on it. Every method
//! blocks the calling thread on the async implementation. Do not call it from within a
//! runtime.

use std::time::Duration;

use anyhow::Context as _;

use crate::{
    checksum::{Buffer, Checksum},
    config::Config,
    context::{self, Context},
    error::Result,
    expression::Expression,
    join::{JoinDict, JoinOutcome},
    transformation_cache::{RunOptions, Transformation, TransformationStatus, UndoOutcome},
};

/// A [`Context`] together with the runtime that drives it.
#[derive(Debug)]
pub struct BlockingContext {
    rt: tokio::runtime::Runtime,
    ctx: Context,
}

impl BlockingContext {
    /// Creates the runtime, then the context from `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let rt = runtime()?;
        let ctx = rt.block_on(Context::from_config(config))?;
        Ok(Self { rt, ctx })
    }

    /// Creates the runtime, then builds the context on it.
    pub fn from_builder(builder: context::Builder) -> anyhow::Result<Self> {
        let rt = runtime()?;
        let ctx = {
            let _guard = rt.enter();
            builder.build()
        };
        Ok(Self { rt, ctx })
    }

    /// The async context, for use with [`Self::block_on`].
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Runs a future on the runtime of the context.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.rt.block_on(future)
    }

    pub fn get_buffer(&self, checksum: &Checksum) -> Result<Buffer> {
        self.rt.block_on(self.ctx.get_buffer(checksum))
    }

    /// Stores a buffer in the cache and returns its checksum.
    pub fn put_buffer(&self, buffer: impl Into<Buffer>) -> Checksum {
        let buffer = buffer.into();
        let checksum = buffer.checksum();
        self.rt
            .block_on(self.ctx.buffers().cache(&checksum, buffer));
        checksum
    }

    pub fn fingertip(&self, checksum: &Checksum, must_have_cell: bool) -> Result<Buffer> {
        self.rt
            .block_on(self.ctx.fingertip(checksum, must_have_cell))
    }

    pub fn evaluate_expression(
        &self,
        expression: &Expression,
        fingertip: bool,
    ) -> Result<Option<Checksum>> {
        self.rt
            .block_on(self.ctx.evaluate_expression(expression, fingertip))
    }

    pub fn evaluate_join(&self, join: &JoinDict, fingertip: bool) -> Result<JoinOutcome> {
        self.rt.block_on(self.ctx.evaluate_join(join, fingertip))
    }

    pub fn run_transformation(
        &self,
        transformation: &Transformation,
        options: RunOptions,
    ) -> Result<Checksum> {
        self.rt
            .block_on(self.ctx.run_transformation(transformation, options))
    }

    pub fn transformation_status(&self, tf_checksum: &Checksum) -> Result<TransformationStatus> {
        self.rt
            .block_on(self.ctx.transformations().transformation_status(tf_checksum))
    }

    pub fn undo(&self, tf_checksum: &Checksum) -> Result<UndoOutcome> {
        self.rt
            .block_on(self.ctx.transformations().undo(tf_checksum))
    }

    /// Destroys the context and stops the runtime.
    pub fn shutdown(self) {
        self.ctx.destroy();
        // jobs may be blocked on io, do not wait for them indefinitely
        self.rt.shutdown_timeout(Duration::from_millis(500));
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("cellstore-runtime")
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to start the runtime")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{celltype::Celltype, serialize::json_dumps};

    #[test]
    fn blocking_calls_from_a_plain_thread() -> anyhow::Result<()> {
        let store = BlockingContext::from_config(Config::default())?;
        let source = store.put_buffer(json_dumps(&json!({"a": [1, 2]})));
        let expression = Expression::conversion(source, Celltype::Plain, Celltype::Mixed);
        let result = store.evaluate_expression(&expression, false)?;
        assert_eq!(result, Some(source));
        assert_eq!(store.get_buffer(&source)?.checksum(), source);
        assert!(store.get_buffer(&Checksum::new(b"absent")).is_err());
        store.shutdown();
        Ok(())
    }

    #[test]
    fn from_builder_enters_the_runtime() -> anyhow::Result<()> {
        let store = BlockingContext::from_builder(Context::builder())?;
        let c = store.put_buffer("text\n");
        assert_eq!(store.fingertip(&c, false)?, Buffer::from("text\n"));
        store.shutdown();
        Ok(())
    }
}
