//! The store context.
//!
//! A [`Context`] owns every component of the store: the database client, the buffer info
//! store, the remote tiers, the buffer cache, the converter, the reference table, the
//! expression and join caches, and the transformation cache. It is constructed explicitly
//! and torn down with [`Context::destroy`]. There is no global state.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context as _;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    buffer_cache::BufferCache,
    buffer_info::BufferInfoStore,
    checksum::{Buffer, Checksum},
    config::Config,
    convert::{Converter, DefaultValueConversion, ValueConversion},
    database::Database,
    error::Result,
    expression::{self, BufferSource, Expression, ExpressionCache},
    fingertip::{FingerTipper, InFlight},
    join::{self, AuthCleanup, JoinCache, JoinDict, JoinOutcome},
    refs::{Holder, HolderId, RefTable},
    remote::RemoteBufferLayer,
    serialize::{DefaultSerializer, Serializer},
    transformation_cache::{
        CodeNormalizer, Executor, LineNormalizer, NoExecutor, RunOptions, Transformation,
        TransformationCache,
    },
};

/// Builder for a [`Context`].
#[derive(Debug)]
pub struct Builder {
    config: Config,
    database: Database,
    remote: Option<RemoteBufferLayer>,
    serializer: Arc<dyn Serializer>,
    value_conversion: Arc<dyn ValueConversion>,
    executor: Arc<dyn Executor>,
    normalizer: Arc<dyn CodeNormalizer>,
}

impl Builder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Uses a connected database. The default is an inactive client.
    pub fn database(mut self, database: Database) -> Self {
        self.database = database;
        self
    }

    /// Uses prepared remote tiers instead of building them from the config without probing.
    pub fn remote(mut self, remote: RemoteBufferLayer) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn value_conversion(mut self, value_conversion: Arc<dyn ValueConversion>) -> Self {
        self.value_conversion = value_conversion;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn CodeNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Builds the context. Must be called within a tokio runtime, which hosts the actors of
    /// the buffer and transformation caches.
    pub fn build(self) -> Context {
        let Builder {
            config,
            database,
            remote,
            serializer,
            value_conversion,
            executor,
            normalizer,
        } = self;
        let remote = remote.unwrap_or_else(|| RemoteBufferLayer::new(config.remote.clone()));
        let infos = Arc::new(BufferInfoStore::new(database.clone()));
        let buffers = BufferCache::new(config.buffer.clone(), remote, infos);
        let converter =
            Converter::new(buffers.clone(), serializer).with_value_conversion(value_conversion);
        let refs = RefTable::new(buffers.clone());
        let transformations =
            TransformationCache::builder(converter.clone(), database.clone(), refs.clone())
                .config(config.transformation.clone())
                .executor(executor)
                .normalizer(normalizer)
                .build();
        Context {
            inner: Arc::new(Inner {
                config,
                database,
                buffers,
                converter,
                refs,
                expressions: ExpressionCache::default(),
                joins: JoinCache::default(),
                transformations,
                held_expressions: Mutex::new(HashMap::new()),
                fingertips: Arc::default(),
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: Config,
    database: Database,
    buffers: BufferCache,
    converter: Converter,
    refs: RefTable,
    expressions: ExpressionCache,
    joins: JoinCache,
    transformations: TransformationCache,
    held_expressions: Mutex<HashMap<Expression, HolderId>>,
    fingertips: Arc<InFlight>,
}

/// Every component of the store. Clones share the components.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn builder() -> Builder {
        Builder {
            config: Config::default(),
            database: Database::inactive(),
            remote: None,
            serializer: Arc::new(DefaultSerializer),
            value_conversion: Arc::new(DefaultValueConversion),
            executor: Arc::new(NoExecutor),
            normalizer: Arc::new(LineNormalizer),
        }
    }

    /// Builds a context from a config, connecting the database and probing the write server.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let database = match &config.database {
            Some(url) => Database::connect(url.clone(), config.remote.connect_trials)
                .await
                .with_context(|| format!("failed to connect to the database at {url}"))?,
            None => Database::inactive(),
        };
        let remote = RemoteBufferLayer::from_config(config.remote.clone())
            .await
            .context("failed to set up the remote buffer tiers")?;
        Ok(Self::builder()
            .config(config)
            .database(database)
            .remote(remote)
            .build())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn buffers(&self) -> &BufferCache {
        &self.inner.buffers
    }

    pub fn buffer_info(&self) -> &Arc<BufferInfoStore> {
        self.inner.buffers.buffer_info()
    }

    pub fn remote(&self) -> &RemoteBufferLayer {
        self.inner.buffers.remote()
    }

    pub fn converter(&self) -> &Converter {
        &self.inner.converter
    }

    pub fn refs(&self) -> &RefTable {
        &self.inner.refs
    }

    pub fn expressions(&self) -> &ExpressionCache {
        &self.inner.expressions
    }

    pub fn joins(&self) -> &JoinCache {
        &self.inner.joins
    }

    pub fn transformations(&self) -> &TransformationCache {
        &self.inner.transformations
    }

    pub(crate) fn fingertips(&self) -> &Arc<InFlight> {
        &self.inner.fingertips
    }

    /// A fingertipper over this context.
    pub fn fingertipper(&self) -> FingerTipper {
        FingerTipper::new(self.clone())
    }

    /// Gets a buffer from memory or the remote tiers, recomputing it if both miss.
    pub async fn get_buffer(&self, checksum: &Checksum) -> Result<Buffer> {
        if let Some(buffer) = self.buffers().get(checksum, true).await {
            return Ok(buffer);
        }
        debug!(%checksum, "buffer not found, fingertipping");
        self.fingertip(checksum, false).await
    }

    /// Recomputes a buffer from its provenance.
    ///
    /// With `must_have_cell`, only checksums held by a cell are recomputed.
    pub async fn fingertip(&self, checksum: &Checksum, must_have_cell: bool) -> Result<Buffer> {
        self.fingertipper()
            .fingertip(checksum, must_have_cell)
            .await
    }

    /// Evaluates an expression and holds its result.
    ///
    /// Outside of fingertip mode, a result known to the expression cache or the database is
    /// returned without evaluation. In fingertip mode, missing input buffers are recomputed.
    pub async fn evaluate_expression(
        &self,
        expression: &Expression,
        fingertip: bool,
    ) -> Result<Option<Checksum>> {
        let known = if fingertip {
            None
        } else {
            self.known_expression_result(expression).await
        };
        let result = match known {
            Some(result) => Some(result),
            None => {
                let tipper;
                let source: &dyn BufferSource = if fingertip {
                    tipper = self.fingertipper();
                    &tipper
                } else {
                    self.buffers()
                };
                let result = expression::evaluate(self.converter(), source, expression).await?;
                if let Some(result) = result {
                    self.record_expression(expression, &result).await;
                }
                result
            }
        };
        if let Some(result) = &result {
            self.hold_expression(expression, result).await;
        }
        Ok(result)
    }

    async fn known_expression_result(&self, expression: &Expression) -> Option<Checksum> {
        if let Some(result) = self.expressions().get(expression) {
            return Some(result);
        }
        match self.database().get_expression(expression).await {
            Ok(Some(result)) => {
                self.expressions().set(expression, result);
                Some(result)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("failed to get expression result: {err}");
                None
            }
        }
    }

    async fn record_expression(&self, expression: &Expression, result: &Checksum) {
        if expression.is_trivial_for(result) {
            return;
        }
        self.expressions().set(expression, *result);
        if let Err(err) = self.database().set_expression(expression, result).await {
            warn!("failed to store expression result: {err}");
        }
    }

    async fn hold_expression(&self, expression: &Expression, result: &Checksum) {
        let refs = self.refs();
        let (id, is_new) = {
            let mut held = self.inner.held_expressions.lock();
            match held.get(expression) {
                Some(id) => (*id, false),
                None => {
                    let id = refs.register(Holder::Expression(expression.clone()));
                    held.insert(expression.clone(), id);
                    (id, true)
                }
            }
        };
        if is_new {
            refs.incref(expression.checksum(), id, false, false).await;
        }
        refs.incref(result, id, false, true).await;
    }

    /// Releases the source and result of an evaluated expression.
    pub fn release_expression(&self, expression: &Expression) -> bool {
        let Some(id) = self.inner.held_expressions.lock().remove(expression) else {
            return false;
        };
        self.refs().unregister(id);
        true
    }

    /// Evaluates a structured cell join.
    ///
    /// Outside of fingertip mode, a result known to the join cache or the database is
    /// returned without evaluation.
    pub async fn evaluate_join(&self, join: &JoinDict, fingertip: bool) -> Result<JoinOutcome> {
        let join_checksum = join.checksum();
        if !fingertip {
            if let Some(result) = self.known_join_result(join, &join_checksum).await {
                return Ok(JoinOutcome {
                    result,
                    auth: AuthCleanup::Unchanged,
                });
            }
        }
        self.buffers().cache(&join_checksum, join.to_buffer()).await;
        let tipper;
        let source: &dyn BufferSource = if fingertip {
            tipper = self.fingertipper();
            &tipper
        } else {
            self.buffers()
        };
        let outcome = join::evaluate_join(self.converter(), source, join).await?;
        self.joins().set(join, outcome.result);
        if let Err(err) = self
            .database()
            .set_structured_cell_join(&join_checksum, &outcome.result)
            .await
        {
            warn!(join = %join_checksum, "failed to store join result: {err}");
        }
        Ok(outcome)
    }

    async fn known_join_result(
        &self,
        join: &JoinDict,
        join_checksum: &Checksum,
    ) -> Option<Checksum> {
        if let Some(result) = self.joins().get(join) {
            return Some(result);
        }
        match self.database().get_structured_cell_join(join_checksum).await {
            Ok(Some(result)) => {
                self.joins().set(join, result);
                Some(result)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(join = %join_checksum, "failed to get join result: {err}");
                None
            }
        }
    }

    /// Runs a transformation given by value, storing its buffer first.
    pub async fn run_transformation(
        &self,
        transformation: &Transformation,
        options: RunOptions,
    ) -> Result<Checksum> {
        let buffer = transformation.to_buffer();
        let tf_checksum = buffer.checksum();
        self.buffers().cache(&tf_checksum, buffer).await;
        self.transformations()
            .run_transformation(&tf_checksum, options)
            .await
    }

    /// Tears down every component. Live references are reported and released.
    pub fn destroy(&self) {
        self.inner.transformations.destroy();
        self.inner.held_expressions.lock().clear();
        self.inner.refs.clear();
        self.inner.expressions.clear();
        self.inner.joins.clear();
        self.inner.buffers.destroy();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        celltype::Celltype,
        deep_structure::PathItem,
        error::Error,
        serialize::json_dumps,
        value::Value,
    };

    #[tokio::test]
    async fn expression_results_are_cached_and_held() -> anyhow::Result<()> {
        let ctx = Context::builder().build();
        let source = ctx
            .converter()
            .store(&Value::Json(json!({"a": 1, "b": [2, 3]})), Celltype::Plain)
            .await?;
        let expr = Expression::new(
            source,
            vec![PathItem::Key("b".into())],
            Celltype::Plain,
            Celltype::Plain,
            None,
            None,
            None,
        )?;
        let result = ctx.evaluate_expression(&expr, false).await?;
        let expected = Checksum::new(json_dumps(&json!([2, 3])));
        assert_eq!(result, Some(expected));
        assert_eq!(ctx.expressions().get(&expr), Some(expected));
        assert_eq!(ctx.refs().expressions_with_result(&expected), vec![expr.clone()]);
        assert_eq!(ctx.buffers().refcount(&expected), 1);
        assert_eq!(ctx.buffers().refcount(&source), 1);

        // a second evaluation holds nothing more
        ctx.evaluate_expression(&expr, false).await?;
        assert_eq!(ctx.buffers().refcount(&expected), 1);

        assert!(ctx.release_expression(&expr));
        assert!(!ctx.release_expression(&expr));
        assert_eq!(ctx.buffers().refcount(&expected), 0);
        ctx.destroy();
        Ok(())
    }

    #[tokio::test]
    async fn trivial_expressions_are_not_recorded() -> anyhow::Result<()> {
        let ctx = Context::builder().build();
        let source = ctx
            .converter()
            .store(&Value::Json(json!(42)), Celltype::Plain)
            .await?;
        let expr = Expression::conversion(source, Celltype::Plain, Celltype::Plain);
        assert_eq!(ctx.evaluate_expression(&expr, false).await?, Some(source));
        assert_eq!(ctx.expressions().get(&expr), None);
        ctx.destroy();
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_a_cache_miss() -> anyhow::Result<()> {
        let ctx = Context::builder().build();
        let expr = Expression::conversion(Checksum::new(b"7\n"), Celltype::Plain, Celltype::Text);
        let err = ctx.evaluate_expression(&expr, false).await.unwrap_err();
        assert!(matches!(err, Error::CacheMiss(_)), "{err:?}");
        ctx.destroy();
        Ok(())
    }

    #[tokio::test]
    async fn joins_are_cached() -> anyhow::Result<()> {
        let ctx = Context::builder().build();
        let a = ctx
            .converter()
            .store(&Value::Json(json!(1)), Celltype::Mixed)
            .await?;
        let join = JoinDict::default().with_inchannel(&[PathItem::Key("a".into())], a);
        let outcome = ctx.evaluate_join(&join, false).await?;
        let expected = Checksum::new(json_dumps(&json!({"a": 1})));
        assert_eq!(outcome.result, expected);
        assert_eq!(ctx.joins().get(&join), Some(expected));
        assert_eq!(ctx.joins().joins_for(&expected), vec![join.clone()]);
        // the join dict itself is available by checksum
        assert!(ctx.buffers().get_local(&join.checksum()).is_some());

        let again = ctx.evaluate_join(&join, false).await?;
        assert_eq!(again.result, expected);
        ctx.destroy();
        Ok(())
    }

    #[tokio::test]
    async fn get_buffer_misses_without_provenance() -> anyhow::Result<()> {
        let ctx = Context::builder().build();
        let buffer = Buffer::from("present\n");
        ctx.buffers().cache(&buffer.checksum(), buffer.clone()).await;
        assert_eq!(ctx.get_buffer(&buffer.checksum()).await?, buffer);

        let missing = Checksum::new(b"absent\n");
        let err = ctx.get_buffer(&missing).await.unwrap_err();
        assert!(matches!(err, Error::CacheMiss(_)), "{err:?}");
        ctx.destroy();
        Ok(())
    }

    #[tokio::test]
    async fn from_default_config() -> anyhow::Result<()> {
        let ctx = Context::from_config(Config::default()).await?;
        assert!(!ctx.database().is_active());
        assert!(!ctx.remote().can_write());
        ctx.destroy();
        Ok(())
    }
}
