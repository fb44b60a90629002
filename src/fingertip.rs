//! Recomputation of missing buffers from their provenance.
//!
//! When a buffer is neither in memory nor in a remote tier, the [`FingerTipper`] looks for
//! ways to compute it again:
//!
//! 1. transformations whose recorded result is the checksum,
//! 2. expressions and joins that evaluated to it,
//! 3. syntactic buffers whose semantic form it is,
//! 4. reverse conversion fields of the buffer info store,
//! 5. the reverse relations of the database, if everything else came up empty.
//!
//! All candidates run concurrently. The first one to put the buffer in the cache wins and the
//! others are aborted. Candidates fetch their own inputs through the fingertipper, so missing
//! inputs are recomputed recursively. A checksum is tried at most once along each chain.
//!
//! Concurrent fingertips of the same checksum are deduplicated: the first caller does the
//! work, later callers wait for its result. Only top level requests wait, so requests made
//! on behalf of a candidate never block on another caller.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use futures_buffered::try_join_all;
use futures_lite::future::Boxed;
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    context::Context,
    database::SemKey,
    error::{CacheMiss, ConversionError, Result},
    expression::{self, BufferSource, Expression},
    join::{self, JoinDict},
    refs::Holder,
    transformation_cache::{Dunder, RunOptions},
};

/// A way to compute a checksum.
#[derive(Debug, Clone, PartialEq)]
enum Candidate {
    /// Run a transformation, by tf_checksum.
    Transformation(Checksum),
    Expression(Expression),
    Join(JoinDict),
    /// A join known only by the checksum of its join dict.
    JoinChecksum(Checksum),
    /// Compute the semantic form of a syntactic buffer.
    Syntactic {
        checksum: Checksum,
        celltype: Celltype,
        subcelltype: Option<String>,
    },
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transformation(tf) => write!(f, "transformation {tf}"),
            Self::Expression(expression) => write!(f, "expression {expression}"),
            Self::Join(join) => write!(f, "join {}", join.checksum()),
            Self::JoinChecksum(checksum) => write!(f, "join {checksum}"),
            Self::Syntactic {
                checksum, celltype, ..
            } => write!(f, "{celltype} code {checksum}"),
        }
    }
}

type Waiter = watch::Receiver<Option<Result<Buffer>>>;

/// Fingertips in progress, by checksum and whether transformations may run.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    running: Mutex<HashMap<(Checksum, bool), Waiter>>,
}

enum Slot {
    Leader(Leader),
    Follower(Waiter),
}

impl InFlight {
    fn join(self: &Arc<Self>, checksum: Checksum, recompute: bool) -> Slot {
        let key = (checksum, recompute);
        let mut running = self.running.lock();
        if let Some(rx) = running.get(&key) {
            return Slot::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        running.insert(key, rx);
        Slot::Leader(Leader {
            registry: self.clone(),
            key,
            tx,
        })
    }
}

/// The caller doing the work. Unregisters on drop, also when cancelled.
struct Leader {
    registry: Arc<InFlight>,
    key: (Checksum, bool),
    tx: watch::Sender<Option<Result<Buffer>>>,
}

impl Leader {
    fn finish(self, result: Result<Buffer>) {
        self.tx.send_replace(Some(result));
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        self.registry.running.lock().remove(&self.key);
    }
}

/// Recomputes buffers from transformations, expressions, joins and syntactic sources.
#[derive(derive_more::Debug, Clone)]
pub struct FingerTipper {
    #[debug(skip)]
    ctx: Context,
    /// Run transformations. Without it, only cheap provenance is used.
    recompute: bool,
    dunder: Option<Dunder>,
    /// Checksums already tried along the current chain.
    done: BTreeSet<Checksum>,
}

impl FingerTipper {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            recompute: true,
            dunder: None,
            done: BTreeSet::new(),
        }
    }

    /// Whether transformations may be run again. Enabled by default.
    pub fn recompute(mut self, recompute: bool) -> Self {
        self.recompute = recompute;
        self
    }

    /// Execution settings for transformations that are run again.
    pub fn dunder(mut self, dunder: Dunder) -> Self {
        self.dunder = Some(dunder);
        self
    }

    /// Gets a buffer, recomputing it if needed.
    ///
    /// With `must_have_cell`, a checksum that is not held by a cell is not recomputed.
    pub async fn fingertip(&self, checksum: &Checksum, must_have_cell: bool) -> Result<Buffer> {
        let buffers = self.ctx.buffers();
        if let Some(buffer) = buffers.get(checksum, true).await {
            return Ok(buffer);
        }
        if self.done.contains(checksum) {
            trace!(%checksum, "already tried");
            return Err(CacheMiss::new(*checksum).into());
        }
        if must_have_cell && !self.ctx.refs().has_cell(checksum) {
            debug!(%checksum, "not held by a cell, not recomputing");
            return Err(CacheMiss::new(*checksum).into());
        }
        if !self.done.is_empty() {
            return self.recompute_buffer(checksum).await;
        }
        let leader = match self.ctx.fingertips().join(*checksum, self.recompute) {
            Slot::Leader(leader) => leader,
            Slot::Follower(mut rx) => {
                trace!(%checksum, "fingertip in progress, waiting");
                if let Ok(done) = rx.wait_for(Option::is_some).await {
                    if let Some(result) = done.clone() {
                        return result;
                    }
                }
                // the other caller went away without a result
                return self.recompute_buffer(checksum).await;
            }
        };
        let result = self.recompute_buffer(checksum).await;
        leader.finish(result.clone());
        result
    }

    async fn recompute_buffer(&self, checksum: &Checksum) -> Result<Buffer> {
        let buffers = self.ctx.buffers();
        let mut chain = self.clone();
        chain.done.insert(*checksum);
        let candidates = chain.candidates(checksum).await;
        if candidates.is_empty() {
            debug!(%checksum, "no provenance");
            return Err(CacheMiss::new(*checksum).into());
        }
        debug!(%checksum, candidates = candidates.len(), "fingertip");
        let trail = chain.race(checksum, candidates).await;
        match buffers.get(checksum, false).await {
            Some(buffer) => Ok(buffer),
            None => Err(CacheMiss::with_trail(*checksum, trail).into()),
        }
    }

    async fn candidates(&self, checksum: &Checksum) -> Vec<Candidate> {
        let ctx = &self.ctx;
        let mut found = Vec::new();
        let mut push = |candidate: Candidate| {
            if !found.contains(&candidate) {
                found.push(candidate);
            }
        };
        if self.recompute {
            for tf in ctx.transformations().transformations_with_result(checksum) {
                push(Candidate::Transformation(tf));
            }
        }
        for (_, holder, result) in ctx.refs().holders(checksum) {
            if !result {
                continue;
            }
            match holder {
                Holder::Expression(expression) => push(Candidate::Expression(expression)),
                Holder::Join(join) => push(Candidate::JoinChecksum(join)),
                Holder::Transformation(tf) if self.recompute => {
                    push(Candidate::Transformation(tf))
                }
                _ => {}
            }
        }
        for expression in ctx.expressions().expressions_for(checksum) {
            push(Candidate::Expression(expression));
        }
        for join in ctx.joins().joins_for(checksum) {
            push(Candidate::Join(join));
        }
        if found.is_empty() {
            found = self.syntactic_sources(checksum).await;
        }
        if found.is_empty() {
            found = ctx
                .buffer_info()
                .reverse_conversions(checksum)
                .into_iter()
                .map(|(field, source)| {
                    let (celltype, target) = field.celltypes();
                    Candidate::Expression(Expression::conversion(source, celltype, target))
                })
                .collect();
        }
        if found.is_empty() && ctx.database().is_active() {
            found = self.mine_database(checksum).await;
        }
        found
    }

    /// Syntactic buffers with `checksum` as their semantic form.
    async fn syntactic_sources(&self, checksum: &Checksum) -> Vec<Candidate> {
        let tcache = self.ctx.transformations();
        let syntactic = |key: SemKey, checksums: Vec<Checksum>| {
            checksums
                .into_iter()
                .map(|syntactic| Candidate::Syntactic {
                    checksum: syntactic,
                    celltype: key.celltype,
                    subcelltype: key.subcelltype.clone(),
                })
                .collect::<Vec<_>>()
        };
        for subcelltype in [None, Some("transformer")] {
            let key = SemKey::new(*checksum, Celltype::Python, subcelltype);
            if let Some(checksums) = tcache.semantic_to_syntactic(&key).await {
                return syntactic(key, checksums);
            }
        }
        tcache
            .semantic_sources(checksum)
            .into_iter()
            .flat_map(|(key, checksums)| syntactic(key, checksums))
            .collect()
    }

    async fn mine_database(&self, checksum: &Checksum) -> Vec<Candidate> {
        let db = self.ctx.database();
        let mut found = Vec::new();
        match db.get_rev_expression(checksum).await {
            Ok(expressions) => found.extend(
                expressions
                    .into_iter()
                    .flatten()
                    .map(Candidate::Expression),
            ),
            Err(err) => warn!(%checksum, "database mining for expressions failed: {err}"),
        }
        match db.get_rev_join(checksum).await {
            Ok(joins) => found.extend(joins.into_iter().flatten().map(Candidate::JoinChecksum)),
            Err(err) => warn!(%checksum, "database mining for joins failed: {err}"),
        }
        if self.recompute {
            match db.get_rev_transformations(checksum).await {
                Ok(tfs) => {
                    found.extend(tfs.into_iter().flatten().map(Candidate::Transformation))
                }
                Err(err) => warn!(%checksum, "database mining for transformations failed: {err}"),
            }
        }
        if !found.is_empty() {
            debug!(%checksum, candidates = found.len(), "mined the database");
        }
        found
    }

    /// Runs the candidates until one of them produces the buffer.
    ///
    /// Returns the failures, formatted for a cache miss.
    async fn race(&self, checksum: &Checksum, candidates: Vec<Candidate>) -> String {
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            let this = self.clone();
            let span = error_span!("candidate", %candidate);
            tasks.spawn(
                async move {
                    let label = candidate.to_string();
                    (label, this.try_candidate(candidate).await)
                }
                .instrument(span),
            );
        }
        let mut failures = Vec::new();
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok((_, Ok(()))) => {}
                Ok((label, Err(err))) => {
                    debug!(%checksum, "{label} failed: {err}");
                    failures.push(format!("{label}: {err}"));
                }
                Err(err) => failures.push(format!("candidate task failed: {err}")),
            }
            if self.ctx.buffers().get_local(checksum).is_some() {
                tasks.abort_all();
                return String::new();
            }
        }
        if failures.is_empty() {
            return String::new();
        }
        format!("\nFingertip exceptions:\n\n{}", failures.join("\n\n"))
    }

    async fn try_candidate(&self, candidate: Candidate) -> Result<()> {
        let ctx = &self.ctx;
        match candidate {
            Candidate::Transformation(tf_checksum) => {
                let tcache = ctx.transformations();
                let transformation = tcache
                    .get_transformation(&tf_checksum)
                    .await?
                    .ok_or_else(|| CacheMiss::new(tf_checksum))?;
                let mut inputs = Vec::new();
                for pin in transformation.pins.values() {
                    let Some(key) = pin.sem_key() else {
                        continue;
                    };
                    let syntactic = if pin.celltype.syntactic_is_semantic() {
                        None
                    } else {
                        tcache
                            .semantic_to_syntactic(&key)
                            .await
                            .and_then(|checksums| checksums.first().copied())
                    };
                    inputs.push(syntactic.unwrap_or(key.checksum));
                }
                inputs.extend(transformation.env);
                try_join_all(inputs.into_iter().map(|input| self.fetch(input))).await?;
                let options = RunOptions {
                    fingertip: true,
                    scratch: true,
                    dunder: self.dunder.clone(),
                };
                tcache.run_transformation(&tf_checksum, options).await?;
            }
            Candidate::Expression(expression) => {
                expression::evaluate(ctx.converter(), self, &expression).await?;
            }
            Candidate::Join(join) => {
                join::evaluate_join(ctx.converter(), self, &join).await?;
            }
            Candidate::JoinChecksum(join_checksum) => {
                let buffer = self.fetch(join_checksum).await?;
                let join = JoinDict::from_buffer(&buffer)?;
                if join.inchannels.is_empty() {
                    return Err(ConversionError::new("Unsuitable join dict (no inchannels)").into());
                }
                join::evaluate_join(ctx.converter(), self, &join).await?;
            }
            Candidate::Syntactic {
                checksum,
                celltype,
                subcelltype,
            } => {
                self.fetch(checksum).await?;
                ctx.transformations()
                    .syntactic_to_semantic(&checksum, celltype, subcelltype.as_deref(), "fingertip")
                    .await?;
            }
        }
        Ok(())
    }
}

impl BufferSource for FingerTipper {
    fn fetch(&self, checksum: Checksum) -> Boxed<Result<Buffer>> {
        let this = self.clone();
        Box::pin(async move { this.fingertip(&checksum, false).await })
    }
}
