//! Transformations, their jobs and their results.
//!
//! A transformation is a map of input pins to semantic checksums, together with a few
//! language and output fields. Its identity, the tf_checksum, is the checksum of its
//! canonical serialization, which leaves out the fields that do not influence the result
//! (`__meta__`, `__env__`, `__compilers__`, `__languages__`, `__code_checksum__` and
//! `SPECIAL__*` pins).
//!
//! Holders incref a transformation. When the last holder lets go, the transformation is kept
//! alive for a short while by a background actor, and then destroyed together with its
//! running job. There is at most one job per tf_checksum; the body of the job is run by a
//! pluggable [`Executor`].

use std::{
    collections::{hash_map, BTreeMap, BTreeSet, HashMap},
    fmt,
    pin::pin,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use futures_lite::{future::Boxed, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, time::DelayQueue};
use tracing::{debug, error_span, info, trace, warn, Instrument};

use crate::{
    buffer_cache::{BufferCache, BufferRef},
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    config::TransformationConfig,
    convert::Converter,
    database::{Database, SemKey},
    error::{CacheMiss, Result},
    refs::{Holder, HolderId, RefTable},
    serialize::json_dumps,
};

/// Capacity of the progress channel of a job.
const UPDATE_CAP: usize = 32;

/// A job was cancelled on request while it was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("HardCancelError")]
pub struct HardCancelError;

/// Failure to obtain a transformation result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformationError {
    /// The executor reported a failure.
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    HardCancel(#[from] HardCancelError),
    #[error("Transformation result is undefined")]
    Undefined,
    #[error("Transformation job was cancelled")]
    Cancelled,
    #[error("No executor is available for transformation {0}")]
    NoExecutor(Checksum),
    #[error("Unknown transformation result")]
    UnknownResult,
    #[error("Transformation finished, but didn't trigger a result or exception")]
    NoResult,
    #[error("No syntactic checksum known for semantic checksum {checksum} ({celltype})")]
    UnknownSemantic {
        checksum: Checksum,
        celltype: Celltype,
    },
    #[error("Malformed transformation: {0}")]
    Malformed(String),
    #[error("Cannot normalize {codename}: {message}")]
    Normalize { codename: String, message: String },
}

/// An input pin: celltype, subcelltype and semantic checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "(Celltype, Option<String>, Option<Checksum>)",
    into = "(Celltype, Option<String>, Option<Checksum>)"
)]
pub struct Pin {
    pub celltype: Celltype,
    pub subcelltype: Option<String>,
    pub checksum: Option<Checksum>,
}

impl Pin {
    pub fn new(celltype: Celltype, checksum: Checksum) -> Self {
        Self {
            celltype,
            subcelltype: None,
            checksum: Some(checksum),
        }
    }

    pub fn sem_key(&self) -> Option<SemKey> {
        let checksum = self.checksum?;
        Some(SemKey::new(checksum, self.celltype, self.subcelltype.as_deref()))
    }
}

impl From<(Celltype, Option<String>, Option<Checksum>)> for Pin {
    fn from(
        (celltype, subcelltype, checksum): (Celltype, Option<String>, Option<Checksum>),
    ) -> Self {
        Self {
            celltype,
            subcelltype,
            checksum,
        }
    }
}

impl From<Pin> for (Celltype, Option<String>, Option<Checksum>) {
    fn from(pin: Pin) -> Self {
        (pin.celltype, pin.subcelltype, pin.checksum)
    }
}

/// Fields of a transformation that do not change its identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dunder {
    pub meta: Option<Json>,
    pub env: Option<Checksum>,
    pub compilers: Option<Json>,
    pub languages: Option<Json>,
}

/// A transformation: input pins plus language and output fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transformation {
    pub pins: BTreeMap<String, Pin>,
    pub language: Option<String>,
    pub output: Option<Json>,
    /// Maps pin names to the variable names seen by the code.
    pub pin_aliases: Option<Json>,
    pub format: Option<Json>,
    pub meta: Option<Json>,
    /// Checksum of the environment description. Kept alive persistently.
    pub env: Option<Checksum>,
    pub compilers: Option<Json>,
    pub languages: Option<Json>,
    pub code_checksum: Option<Checksum>,
    pub special: BTreeMap<String, Json>,
}

impl Transformation {
    pub fn with_pin(mut self, name: impl Into<String>, pin: Pin) -> Self {
        self.pins.insert(name.into(), pin);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Parses the JSON form of a transformation.
    pub fn from_json(value: &Json) -> Result<Self, TransformationError> {
        let Json::Object(map) = value else {
            return Err(TransformationError::Malformed(
                "a transformation must be a dict".to_string(),
            ));
        };
        let checksum_field =
            |key: &str, value: &Json| -> Result<Option<Checksum>, TransformationError> {
                serde_json::from_value(value.clone())
                    .map_err(|err| TransformationError::Malformed(format!("{key}: {err}")))
            };
        let mut tf = Transformation::default();
        for (key, value) in map {
            match key.as_str() {
                "__language__" => {
                    let Json::String(s) = value else {
                        return Err(TransformationError::Malformed(
                            "__language__ must be a string".to_string(),
                        ));
                    };
                    tf.language = Some(s.clone());
                }
                "__output__" => tf.output = Some(value.clone()),
                "__as__" => tf.pin_aliases = Some(value.clone()),
                "__format__" => tf.format = Some(value.clone()),
                "__meta__" => tf.meta = Some(value.clone()),
                "__compilers__" => tf.compilers = Some(value.clone()),
                "__languages__" => tf.languages = Some(value.clone()),
                "__env__" => tf.env = checksum_field(key, value)?,
                "__code_checksum__" => tf.code_checksum = checksum_field(key, value)?,
                _ if key.starts_with("SPECIAL__") => {
                    tf.special.insert(key.clone(), value.clone());
                }
                _ => {
                    let pin: Pin = serde_json::from_value(value.clone()).map_err(|err| {
                        TransformationError::Malformed(format!("pin {key}: {err}"))
                    })?;
                    tf.pins.insert(key.clone(), pin);
                }
            }
        }
        Ok(tf)
    }

    /// The fields that make up the identity of the transformation.
    pub fn canonical_json(&self) -> Json {
        let mut map = serde_json::Map::new();
        for (name, pin) in &self.pins {
            map.insert(name.clone(), json!(pin));
        }
        if let Some(language) = &self.language {
            map.insert("__language__".into(), json!(language));
        }
        let optional = [
            ("__output__", &self.output),
            ("__as__", &self.pin_aliases),
            ("__format__", &self.format),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.into(), value.clone());
            }
        }
        Json::Object(map)
    }

    /// The complete JSON form, including the fields left out of the identity.
    pub fn to_json(&self) -> Json {
        let mut value = self.canonical_json();
        let Json::Object(map) = &mut value else {
            return value;
        };
        let optional = [
            ("__meta__", &self.meta),
            ("__compilers__", &self.compilers),
            ("__languages__", &self.languages),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.into(), value.clone());
            }
        }
        if let Some(env) = &self.env {
            map.insert("__env__".into(), json!(env));
        }
        if let Some(code) = &self.code_checksum {
            map.insert("__code_checksum__".into(), json!(code));
        }
        for (key, value) in &self.special {
            map.insert(key.clone(), value.clone());
        }
        value
    }

    /// The canonical buffer. Its checksum is the tf_checksum.
    pub fn to_buffer(&self) -> Buffer {
        Buffer::new(json_dumps(&self.canonical_json()))
    }

    pub fn checksum(&self) -> Checksum {
        self.to_buffer().checksum()
    }

    pub fn apply_dunder(&mut self, dunder: &Dunder) {
        if let Some(meta) = &dunder.meta {
            self.meta = Some(meta.clone());
        }
        if let Some(env) = dunder.env {
            self.env = Some(env);
        }
        if let Some(compilers) = &dunder.compilers {
            self.compilers = Some(compilers.clone());
        }
        if let Some(languages) = &dunder.languages {
            self.languages = Some(languages.clone());
        }
    }

    /// Checksums kept alive by the transformation, with whether the reference is persistent.
    fn input_checksums(&self) -> impl Iterator<Item = (Checksum, bool)> + '_ {
        self.pins
            .values()
            .filter_map(|pin| pin.checksum)
            .map(|checksum| (checksum, false))
            .chain(self.env.map(|env| (env, true)))
    }
}

/// Turns python source into a normalized form, so that formatting changes keep the
/// semantic checksum.
pub trait CodeNormalizer: fmt::Debug + Send + Sync + 'static {
    fn normalize(&self, code: &str, codename: &str) -> Result<String, TransformationError>;
}

/// Strips trailing whitespace and drops blank lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineNormalizer;

impl CodeNormalizer for LineNormalizer {
    fn normalize(&self, code: &str, _codename: &str) -> Result<String, TransformationError> {
        let mut out = String::with_capacity(code.len());
        for line in code.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Runs the body of a transformation.
pub trait Executor: fmt::Debug + Send + Sync + 'static {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Boxed<Result<ExecutionOutput, TransformationError>>;
}

/// An executor that refuses every job.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExecutor;

impl Executor for NoExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Boxed<Result<ExecutionOutput, TransformationError>> {
        let tf_checksum = request.tf_checksum;
        Box::pin(async move { Err(TransformationError::NoExecutor(tf_checksum)) })
    }
}

/// Everything an [`Executor`] gets to run a job.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub tf_checksum: Checksum,
    /// Name of the holder the job runs for, for messages.
    pub codename: String,
    pub transformation: Arc<Transformation>,
    /// Syntactic checksums for the inputs whose semantic checksum differs.
    pub semantic_cache: HashMap<SemKey, Vec<Checksum>>,
    /// The result buffer does not need to be kept.
    pub scratch: bool,
    /// The job regenerates a known result.
    pub fingertip: bool,
    pub buffers: BufferCache,
    pub reporter: JobReporter,
    /// Cancelled on hard cancel. Sub-jobs should use a child token.
    pub cancel: CancellationToken,
}

/// Result of an execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// `None` means the result is undefined.
    pub result: Option<Checksum>,
    pub logs: String,
    /// Extra execution metadata, a JSON object.
    pub metadata: Option<Json>,
}

#[derive(Debug, Clone, Copy)]
enum JobUpdate {
    Progress(f64),
    Preliminary(Checksum),
}

/// Lets an executor report progress and preliminary results.
#[derive(Debug, Clone)]
pub struct JobReporter {
    tx: mpsc::Sender<JobUpdate>,
}

impl JobReporter {
    /// Reports progress, from 0 to 100. Dropped when updates pile up.
    pub fn progress(&self, progress: f64) {
        self.tx.try_send(JobUpdate::Progress(progress)).ok();
    }

    pub async fn preliminary(&self, checksum: Checksum) {
        self.tx.send(JobUpdate::Preliminary(checksum)).await.ok();
    }
}

/// State of a job as seen by the parties waiting for it.
#[derive(Debug, Clone)]
pub enum JobState {
    Running {
        progress: Option<f64>,
        prelim: Option<Checksum>,
    },
    Done(Result<Checksum, TransformationError>),
}

/// A handle to a running job. Clones watch the same job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    tf_checksum: Checksum,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn tf_checksum(&self) -> &Checksum {
        &self.tf_checksum
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Progress and preliminary result, while running.
    pub fn progress(&self) -> (Option<f64>, Option<Checksum>) {
        match &*self.state.borrow() {
            JobState::Running { progress, prelim } => (*progress, *prelim),
            JobState::Done(_) => (None, None),
        }
    }

    /// Waits for the job to finish.
    pub async fn finished(mut self) -> Result<Checksum, TransformationError> {
        loop {
            if let JobState::Done(res) = &*self.state.borrow_and_update() {
                return res.clone();
            }
            if self.state.changed().await.is_err() {
                return match &*self.state.borrow() {
                    JobState::Done(res) => res.clone(),
                    JobState::Running { .. } => Err(TransformationError::Cancelled),
                };
            }
        }
    }
}

/// Status of a transformation, with the numeric codes of the status protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformationStatus {
    Done(Checksum),
    Running {
        progress: Option<f64>,
        prelim: Option<Checksum>,
    },
    Exception(String),
    Runnable,
    InputsUnavailable,
    Unknown,
}

impl TransformationStatus {
    pub fn code(&self) -> i8 {
        match self {
            Self::Done(_) => 3,
            Self::Running { .. } => 2,
            Self::Runnable => 1,
            Self::Exception(_) => 0,
            Self::InputsUnavailable => -2,
            Self::Unknown => -3,
        }
    }
}

/// Outcome of [`TransformationCache::undo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The result was withdrawn.
    Withdrawn(Checksum),
    /// The database refused, with its message.
    Refused(String),
}

/// What a holder learns when it increfs a transformation.
#[derive(Debug, Clone)]
pub struct IncrefOutcome {
    pub tf_checksum: Checksum,
    pub exception: Option<TransformationError>,
    /// Known result, with whether it is preliminary.
    pub result: Option<(Checksum, bool)>,
}

/// Options of [`TransformationCache::run_transformation`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run even if the result is known, to regenerate its buffer.
    pub fingertip: bool,
    pub scratch: bool,
    pub dunder: Option<Dunder>,
}

#[derive(derive_more::Debug)]
struct Entry {
    transformation: Arc<Transformation>,
    holders: BTreeSet<HolderId>,
    #[debug(skip)]
    _refs: Vec<BufferRef>,
}

#[derive(derive_more::Debug)]
struct TfResult {
    checksum: Checksum,
    prelim: bool,
    /// Released when the transformation is destroyed.
    #[debug(skip)]
    guard: Option<BufferRef>,
}

#[derive(derive_more::Debug)]
struct RunningJob {
    start: Instant,
    progress: Option<f64>,
    cancel: CancellationToken,
    #[debug(skip)]
    state: watch::Receiver<JobState>,
    #[debug(skip)]
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Checksum, Entry>,
    by_holder: HashMap<HolderId, Checksum>,
    results: HashMap<Checksum, TfResult>,
    /// Result to transformations, only for final results.
    results_rev: HashMap<Checksum, Vec<Checksum>>,
    /// Results of transformations launched imperatively.
    known: HashMap<Checksum, Checksum>,
    known_rev: HashMap<Checksum, Vec<Checksum>>,
    exceptions: HashMap<Checksum, TransformationError>,
    logs: HashMap<Checksum, String>,
    jobs: HashMap<Checksum, RunningJob>,
    sem2syn: HashMap<SemKey, Vec<Checksum>>,
    syn2sem: HashMap<SemKey, Checksum>,
    destroyed: bool,
}

#[derive(Debug)]
enum Message {
    KeepAlive { tf_checksum: Checksum, delay: Duration },
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    converter: Converter,
    database: Database,
    holders: RefTable,
    config: TransformationConfig,
    executor: Arc<dyn Executor>,
    normalizer: Arc<dyn CodeNormalizer>,
    keep_alive_tx: mpsc::UnboundedSender<Message>,
}

/// Builder for a [`TransformationCache`].
#[derive(Debug)]
pub struct Builder {
    converter: Converter,
    database: Database,
    holders: RefTable,
    config: TransformationConfig,
    executor: Arc<dyn Executor>,
    normalizer: Arc<dyn CodeNormalizer>,
}

impl Builder {
    pub fn config(mut self, config: TransformationConfig) -> Self {
        self.config = config;
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

    /// Builds the cache and spawns its keep-alive actor on the current runtime.
    pub fn build(self) -> TransformationCache {
        let (keep_alive_tx, keep_alive_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            converter: self.converter,
            database: self.database,
            holders: self.holders,
            config: self.config,
            executor: self.executor,
            normalizer: self.normalizer,
            keep_alive_tx,
        });
        let actor = KeepAliveActor {
            cache: Arc::downgrade(&inner),
            msg_rx: keep_alive_rx,
            queue: DelayQueue::new(),
        };
        tokio::spawn(actor.run().instrument(error_span!("transformation_cache")));
        TransformationCache { inner }
    }
}

/// Transformations, jobs and results. Clones share the cache.
#[derive(Debug, Clone)]
pub struct TransformationCache {
    inner: Arc<Inner>,
}

impl TransformationCache {
    pub fn builder(converter: Converter, database: Database, holders: RefTable) -> Builder {
        Builder {
            converter,
            database,
            holders,
            config: TransformationConfig::default(),
            executor: Arc::new(NoExecutor),
            normalizer: Arc::new(LineNormalizer),
        }
    }

    pub fn holders(&self) -> &RefTable {
        &self.inner.holders
    }

    fn buffers(&self) -> &BufferCache {
        self.inner.converter.buffers()
    }

    /// Makes `holder` hold the transformation.
    ///
    /// A holder holds one transformation at a time; holding a new one releases the old one.
    pub async fn incref_transformation(
        &self,
        transformation: &Transformation,
        holder: HolderId,
    ) -> IncrefOutcome {
        let tf_buffer = transformation.to_buffer();
        let tf_checksum = tf_buffer.checksum();
        let buffers = self.buffers();
        buffers.cache(&tf_checksum, tf_buffer.clone()).await;
        if let Err(err) = buffers.remote().write_buffer(&tf_checksum, &tf_buffer).await {
            warn!(%tf_checksum, "failed to upload transformation: {err}");
        }

        let is_new = !self.inner.state.lock().entries.contains_key(&tf_checksum);
        let mut refs = Vec::new();
        if is_new {
            refs.push(buffers.incref_buffer(&tf_checksum, tf_buffer, false).await);
            for (checksum, persistent) in transformation.input_checksums() {
                refs.push(buffers.incref(&checksum, persistent).await);
            }
        }
        let (old, released_result) = {
            let mut state = self.inner.state.lock();
            let created = match state.entries.entry(tf_checksum) {
                hash_map::Entry::Occupied(mut entry) => {
                    let entry = entry.get_mut();
                    entry.transformation = Arc::new(transformation.clone());
                    entry.holders.insert(holder);
                    false
                }
                hash_map::Entry::Vacant(entry) => {
                    entry.insert(Entry {
                        transformation: Arc::new(transformation.clone()),
                        holders: BTreeSet::from([holder]),
                        _refs: refs,
                    });
                    true
                }
            };
            let released_result = state
                .results
                .get(&tf_checksum)
                .filter(|r| created && r.guard.is_none())
                .map(|r| r.checksum);
            let old = state
                .by_holder
                .insert(holder, tf_checksum)
                .filter(|old| *old != tf_checksum);
            (old, released_result)
        };
        if let Some(result) = released_result {
            let guard = buffers.incref(&result, false).await;
            if let Some(r) = self.inner.state.lock().results.get_mut(&tf_checksum) {
                r.guard.get_or_insert(guard);
            }
        }
        if let Some(old) = old {
            trace!(holder = %holder, old = %old, "holder switches transformation");
            self.release(&old, holder);
        }
        let exception = self.inner.state.lock().exceptions.get(&tf_checksum).cloned();
        let result = self.get_transformation_result(&tf_checksum).await;
        IncrefOutcome {
            tf_checksum,
            exception,
            result,
        }
    }

    /// Releases the hold of `holder`. Returns false if it did not hold the transformation.
    ///
    /// Once nobody holds it, the transformation is destroyed after the keep-alive delay.
    pub fn decref_transformation(&self, tf_checksum: &Checksum, holder: HolderId) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.by_holder.get(&holder) == Some(tf_checksum) {
                state.by_holder.remove(&holder);
            }
        }
        self.release(tf_checksum, holder)
    }

    fn release(&self, tf_checksum: &Checksum, holder: HolderId) -> bool {
        let delay = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(tf_checksum) else {
                warn!(%tf_checksum, %holder, "decref of unknown transformation");
                return false;
            };
            if !entry.holders.remove(&holder) {
                return false;
            }
            if !entry.holders.is_empty() {
                return true;
            }
            let config = &self.inner.config;
            let long_job = state
                .jobs
                .get(tf_checksum)
                .is_some_and(|job| job.start.elapsed() > config.long_job);
            if long_job {
                config.keep_alive_long
            } else {
                config.keep_alive
            }
        };
        trace!(%tf_checksum, ?delay, "keep transformation alive");
        self.inner
            .keep_alive_tx
            .send(Message::KeepAlive {
                tf_checksum: *tf_checksum,
                delay,
            })
            .ok();
        true
    }

    /// Forgets an unheld transformation, cancelling its job and releasing its references.
    ///
    /// Does nothing if the transformation got a new holder in the meantime.
    pub fn destroy_transformation(&self, tf_checksum: &Checksum) {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.entries.get(tf_checksum) {
                None => {
                    warn!(%tf_checksum, "cannot destroy unknown transformation");
                    return;
                }
                Some(entry) if !entry.holders.is_empty() => return,
                Some(_) => {}
            }
            let entry = state.entries.remove(tf_checksum);
            state.logs.remove(tf_checksum);
            let prelim = state.results.get(tf_checksum).map(|r| r.prelim);
            let result = match prelim {
                Some(true) => state.results.remove(tf_checksum).and_then(|r| r.guard),
                Some(false) => state
                    .results
                    .get_mut(tf_checksum)
                    .and_then(|r| r.guard.take()),
                None => None,
            };
            let job = state.jobs.remove(tf_checksum);
            (entry, result, job)
        };
        debug!(%tf_checksum, "destroy transformation");
        let (_entry, _result, job) = removed;
        if let Some(job) = job {
            job.task.abort();
        }
    }

    /// The transformation, if it is held.
    pub fn local_transformation(&self, tf_checksum: &Checksum) -> Option<Arc<Transformation>> {
        self.inner
            .state
            .lock()
            .entries
            .get(tf_checksum)
            .map(|entry| entry.transformation.clone())
    }

    /// The transformation, from memory or from its buffer.
    pub async fn get_transformation(
        &self,
        tf_checksum: &Checksum,
    ) -> Result<Option<Arc<Transformation>>> {
        if let Some(tf) = self.local_transformation(tf_checksum) {
            return Ok(Some(tf));
        }
        let Some(buffer) = self.buffers().get(tf_checksum, true).await else {
            return Ok(None);
        };
        let value: Json = serde_json::from_slice(&buffer)
            .map_err(|err| TransformationError::Malformed(err.to_string()))?;
        Ok(Some(Arc::new(Transformation::from_json(&value)?)))
    }

    /// Records the result of a transformation that was run outside of the cache.
    pub fn register_known_transformation(&self, tf_checksum: &Checksum, result: &Checksum) {
        let mut state = self.inner.state.lock();
        if state.known.get(tf_checksum) == Some(result) {
            return;
        }
        state.known.insert(*tf_checksum, *result);
        state
            .known_rev
            .entry(*result)
            .or_default()
            .push(*tf_checksum);
    }

    /// Transformations known to produce `result`.
    pub fn transformations_with_result(&self, result: &Checksum) -> Vec<Checksum> {
        let state = self.inner.state.lock();
        let mut found: Vec<Checksum> = state
            .results_rev
            .get(result)
            .into_iter()
            .chain(state.known_rev.get(result))
            .flatten()
            .copied()
            .collect();
        found.sort();
        found.dedup();
        found
    }

    async fn set_transformation_result(
        &self,
        tf_checksum: &Checksum,
        result: &Checksum,
        prelim: bool,
    ) {
        let is_final = |state: &State| state.results.get(tf_checksum).is_some_and(|r| !r.prelim);
        if is_final(&*self.inner.state.lock()) {
            // set by something else
            return;
        }
        let guard = self.buffers().incref(result, false).await;
        let stateless = self.inner.config.stateless;
        let old = {
            let mut state = self.inner.state.lock();
            if is_final(&*state) {
                return;
            }
            if !prelim && !stateless {
                state.results_rev.entry(*result).or_default().push(*tf_checksum);
            }
            state.results.insert(
                *tf_checksum,
                TfResult {
                    checksum: *result,
                    prelim,
                    guard: Some(guard),
                },
            )
        };
        drop(old);
        if prelim {
            return;
        }
        if let Err(err) = self
            .inner
            .database
            .set_transformation_result(tf_checksum, result)
            .await
        {
            warn!(%tf_checksum, "failed to store transformation result: {err}");
        }
        if stateless {
            let removed = self.inner.state.lock().results.remove(tf_checksum);
            drop(removed);
        }
    }

    /// The result of a transformation and whether it is preliminary.
    ///
    /// Falls back to the database for final results.
    pub async fn get_transformation_result(
        &self,
        tf_checksum: &Checksum,
    ) -> Option<(Checksum, bool)> {
        if let Some(r) = self.inner.state.lock().results.get(tf_checksum) {
            return Some((r.checksum, r.prelim));
        }
        let result = match self.inner.database.get_transformation_result(tf_checksum).await {
            Ok(result) => result?,
            Err(err) => {
                warn!(%tf_checksum, "failed to get transformation result: {err}");
                return None;
            }
        };
        if !self.inner.config.stateless {
            let guard = self.buffers().incref(&result, false).await;
            let mut state = self.inner.state.lock();
            if let hash_map::Entry::Vacant(entry) = state.results.entry(*tf_checksum) {
                entry.insert(TfResult {
                    checksum: result,
                    prelim: false,
                    guard: Some(guard),
                });
                state.results_rev.entry(result).or_default().push(*tf_checksum);
            }
        }
        Some((result, false))
    }

    /// Logs of the last execution, or the message of its exception.
    pub fn transformation_logs(&self, tf_checksum: &Checksum) -> Option<String> {
        self.inner.state.lock().logs.get(tf_checksum).cloned()
    }

    pub fn transformation_exception(&self, tf_checksum: &Checksum) -> Option<TransformationError> {
        self.inner.state.lock().exceptions.get(tf_checksum).cloned()
    }

    /// Forgets the exception of a transformation, so that it can run again.
    pub fn clear_exception(&self, tf_checksum: &Checksum) -> bool {
        self.inner
            .state
            .lock()
            .exceptions
            .remove(tf_checksum)
            .is_some()
    }

    /// Cancels the running job of a transformation. Its exception becomes a
    /// [`HardCancelError`].
    pub fn hard_cancel(&self, tf_checksum: &Checksum) -> bool {
        let state = self.inner.state.lock();
        let Some(job) = state.jobs.get(tf_checksum) else {
            return false;
        };
        info!(%tf_checksum, "hard cancel");
        job.cancel.cancel();
        true
    }

    /// Records that a semantic checksum was derived from a syntactic one.
    pub async fn register_semantic_to_syntactic(
        &self,
        semantic: &Checksum,
        celltype: Celltype,
        subcelltype: Option<&str>,
        syntactic: &Checksum,
    ) {
        let key = SemKey::new(*semantic, celltype, subcelltype);
        let checksums = {
            let mut state = self.inner.state.lock();
            state
                .syn2sem
                .insert(SemKey::new(*syntactic, celltype, subcelltype), *semantic);
            let checksums = state.sem2syn.entry(key.clone()).or_default();
            if checksums.contains(syntactic) {
                return;
            }
            checksums.push(*syntactic);
            checksums.clone()
        };
        if let Err(err) = self.inner.database.set_sem2syn(&key, &checksums).await {
            warn!(checksum = %semantic, "failed to store semantic to syntactic: {err}");
        }
    }

    /// Syntactic checksums of a semantic checksum, from memory or the database.
    pub async fn semantic_to_syntactic(&self, key: &SemKey) -> Option<Vec<Checksum>> {
        if let Some(found) = self.inner.state.lock().sem2syn.get(key) {
            return Some(found.clone());
        }
        match self.inner.database.get_sem2syn(key).await {
            Ok(Some(found)) => {
                let mut state = self.inner.state.lock();
                for syntactic in &found {
                    let syn_key = SemKey::new(*syntactic, key.celltype, key.subcelltype.as_deref());
                    state.syn2sem.insert(syn_key, key.checksum);
                }
                state.sem2syn.insert(key.clone(), found.clone());
                Some(found)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(checksum = %key.checksum, "failed to get semantic to syntactic: {err}");
                None
            }
        }
    }

    /// Every known mapping from the semantic checksum `semantic`, in memory only.
    pub fn semantic_sources(&self, semantic: &Checksum) -> Vec<(SemKey, Vec<Checksum>)> {
        let state = self.inner.state.lock();
        let mut found: Vec<_> = state
            .sem2syn
            .iter()
            .filter(|(key, _)| key.checksum == *semantic)
            .map(|(key, syn)| (key.clone(), syn.clone()))
            .collect();
        found.sort_by(|(a, _), (b, _)| a.cmp(b));
        found
    }

    /// Computes the semantic checksum of a syntactic one.
    ///
    /// `cson` and `yaml` become `plain`; `python` goes through the [`CodeNormalizer`]. Other
    /// celltypes are their own semantic form.
    pub async fn syntactic_to_semantic(
        &self,
        checksum: &Checksum,
        celltype: Celltype,
        subcelltype: Option<&str>,
        codename: &str,
    ) -> Result<Checksum> {
        if celltype.syntactic_is_semantic() {
            return Ok(*checksum);
        }
        let syn_key = SemKey::new(*checksum, celltype, subcelltype);
        if let Some(semantic) = self.inner.state.lock().syn2sem.get(&syn_key) {
            return Ok(*semantic);
        }
        let buffers = self.buffers();
        let buffer = buffers
            .get(checksum, true)
            .await
            .ok_or_else(|| CacheMiss::new(*checksum))?;
        let semantic = match celltype {
            Celltype::Cson | Celltype::Yaml => {
                self.inner
                    .converter
                    .convert(checksum, celltype, Celltype::Plain, Some(buffer))
                    .await?
            }
            _ => {
                let code = std::str::from_utf8(&buffer).map_err(|err| {
                    TransformationError::Normalize {
                        codename: codename.to_string(),
                        message: err.to_string(),
                    }
                })?;
                let normalized = self.inner.normalizer.normalize(code, codename)?;
                let sem_buffer = Buffer::new(normalized);
                let semantic = sem_buffer.checksum();
                buffers.cache(&semantic, sem_buffer.clone()).await;
                let remote = buffers.remote();
                if remote.can_write() {
                    if let Err(err) = remote.write_buffer(&semantic, &sem_buffer).await {
                        warn!(%semantic, "failed to upload normalized code: {err}");
                    }
                }
                semantic
            }
        };
        self.register_semantic_to_syntactic(&semantic, celltype, subcelltype, checksum)
            .await;
        Ok(semantic)
    }

    /// Syntactic checksums for every input whose semantic checksum differs.
    pub async fn build_semantic_cache(
        &self,
        transformation: &Transformation,
    ) -> Result<HashMap<SemKey, Vec<Checksum>>, TransformationError> {
        let mut cache = HashMap::new();
        for pin in transformation.pins.values() {
            if pin.celltype.syntactic_is_semantic() {
                continue;
            }
            let Some(key) = pin.sem_key() else {
                continue;
            };
            let Some(checksums) = self.semantic_to_syntactic(&key).await else {
                return Err(TransformationError::UnknownSemantic {
                    checksum: key.checksum,
                    celltype: key.celltype,
                });
            };
            cache.insert(key, checksums);
        }
        Ok(cache)
    }

    fn codename(&self, entry: &Entry) -> String {
        let holder = entry
            .holders
            .iter()
            .next_back()
            .and_then(|id| self.inner.holders.holder(*id));
        match holder {
            Some(Holder::Cell(name)) => name,
            Some(_) => "transformer".to_string(),
            None => "<Unknown>".to_string(),
        }
    }

    /// Starts the job of a held transformation, or returns the one that is running.
    pub async fn run_job(
        &self,
        tf_checksum: &Checksum,
        scratch: bool,
        fingertip: bool,
    ) -> Result<JobHandle> {
        let transformation = {
            let state = self.inner.state.lock();
            if let Some(exc) = state.exceptions.get(tf_checksum) {
                return Err(exc.clone().into());
            }
            if let Some(job) = state.jobs.get(tf_checksum) {
                return Ok(JobHandle {
                    tf_checksum: *tf_checksum,
                    state: job.state.clone(),
                });
            }
            let Some(entry) = state.entries.get(tf_checksum) else {
                return Err(CacheMiss::new(*tf_checksum).into());
            };
            entry.transformation.clone()
        };
        let semantic_cache = self.build_semantic_cache(&transformation).await?;

        let mut state = self.inner.state.lock();
        if let Some(job) = state.jobs.get(tf_checksum) {
            return Ok(JobHandle {
                tf_checksum: *tf_checksum,
                state: job.state.clone(),
            });
        }
        let Some(entry) = state.entries.get(tf_checksum) else {
            // destroyed while building the semantic cache
            return Err(TransformationError::Cancelled.into());
        };
        let codename = self.codename(entry);
        debug!(%tf_checksum, %codename, "executing transformation");
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CAP);
        let (state_tx, state_rx) = watch::channel(JobState::Running {
            progress: None,
            prelim: None,
        });
        let cancel = CancellationToken::new();
        let request = ExecutionRequest {
            tf_checksum: *tf_checksum,
            codename,
            transformation,
            semantic_cache,
            scratch,
            fingertip,
            buffers: self.buffers().clone(),
            reporter: JobReporter { tx: update_tx },
            cancel: cancel.child_token(),
        };
        let execution = self.inner.executor.execute(request);
        let driver = JobDriver {
            cache: self.clone(),
            tf_checksum: *tf_checksum,
            updates: update_rx,
            cancel: cancel.clone(),
            state_tx,
        };
        let task = tokio::spawn(
            driver
                .run(execution)
                .instrument(error_span!("job", tf = %tf_checksum.fmt_short())),
        );
        state.jobs.insert(
            *tf_checksum,
            RunningJob {
                start: Instant::now(),
                progress: None,
                cancel,
                state: state_rx.clone(),
                task,
            },
        );
        Ok(JobHandle {
            tf_checksum: *tf_checksum,
            state: state_rx,
        })
    }

    async fn job_update(
        &self,
        tf_checksum: &Checksum,
        update: JobUpdate,
        state_tx: &watch::Sender<JobState>,
    ) {
        match update {
            JobUpdate::Progress(progress) => {
                let progress = progress.clamp(0.0, 100.0);
                if let Some(job) = self.inner.state.lock().jobs.get_mut(tf_checksum) {
                    job.progress = Some(progress);
                }
                state_tx.send_modify(|state| {
                    if let JobState::Running { progress: p, .. } = state {
                        *p = Some(progress);
                    }
                });
            }
            JobUpdate::Preliminary(result) => {
                self.set_transformation_result(tf_checksum, &result, true).await;
                state_tx.send_modify(|state| {
                    if let JobState::Running { prelim, .. } = state {
                        *prelim = Some(result);
                    }
                });
            }
        }
    }

    async fn job_done(
        &self,
        tf_checksum: Checksum,
        outcome: Result<ExecutionOutput, TransformationError>,
        state_tx: &watch::Sender<JobState>,
    ) {
        let (job, destroyed) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            let job = state.jobs.remove(&tf_checksum);
            (job, !state.entries.contains_key(&tf_checksum))
        };
        let (result, metadata) = match outcome {
            Ok(output) => {
                self.inner
                    .state
                    .lock()
                    .logs
                    .insert(tf_checksum, output.logs);
                let result = output.result.ok_or(TransformationError::Undefined);
                (result, output.metadata)
            }
            Err(err) => (Err(err), None),
        };
        if destroyed {
            state_tx.send_replace(JobState::Done(result));
            return;
        }
        match &result {
            Ok(checksum) => {
                debug!(%tf_checksum, result = %checksum, "transformation finished");
                self.set_transformation_result(&tf_checksum, checksum, false)
                    .await;
            }
            Err(err) => {
                debug!(%tf_checksum, "transformation failed: {err}");
                let mut state = self.inner.state.lock();
                state.exceptions.insert(tf_checksum, err.clone());
                state.logs.insert(tf_checksum, err.to_string());
            }
        }
        if self.inner.database.is_active() {
            let mut meta = match metadata {
                Some(Json::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            match &result {
                Ok(_) => {
                    meta.insert("Success".into(), json!(true));
                }
                Err(err) => {
                    meta.insert("Success".into(), json!(false));
                    meta.insert("Exception".into(), json!(err.to_string()));
                    if let Some(job) = &job {
                        if let Some(progress) = job.progress {
                            meta.insert("Progress".into(), json!(progress));
                        }
                        meta.insert(
                            "Execution time (seconds)".into(),
                            json!(job.start.elapsed().as_secs_f64()),
                        );
                    }
                }
            }
            let now = humantime::format_rfc3339_seconds(SystemTime::now());
            meta.insert("Time".into(), json!(now.to_string()));
            if let Err(err) = self
                .inner
                .database
                .set_metadata(&tf_checksum, &Json::Object(meta))
                .await
            {
                warn!(%tf_checksum, "failed to store execution metadata: {err}");
            }
        }
        state_tx.send_replace(JobState::Done(result));
    }

    /// Status of a transformation.
    pub async fn transformation_status(
        &self,
        tf_checksum: &Checksum,
    ) -> Result<TransformationStatus> {
        let result = self.get_transformation_result(tf_checksum).await;
        if let Some((checksum, false)) = result {
            return Ok(TransformationStatus::Done(checksum));
        }
        {
            let state = self.inner.state.lock();
            if let Some(job) = state.jobs.get(tf_checksum) {
                return Ok(TransformationStatus::Running {
                    progress: job.progress,
                    prelim: result.map(|(checksum, _)| checksum),
                });
            }
            if let Some(exc) = state.exceptions.get(tf_checksum) {
                return Ok(TransformationStatus::Exception(exc.to_string()));
            }
        }
        let Some(transformation) = self.get_transformation(tf_checksum).await? else {
            return Ok(TransformationStatus::Unknown);
        };
        for pin in transformation.pins.values() {
            let Some(key) = pin.sem_key() else {
                return Ok(TransformationStatus::InputsUnavailable);
            };
            let candidates = if pin.celltype.syntactic_is_semantic() {
                vec![key.checksum]
            } else {
                self.semantic_to_syntactic(&key).await.unwrap_or_default()
            };
            let mut available = false;
            for candidate in &candidates {
                if self.buffers().buffer_check(candidate).await {
                    available = true;
                    break;
                }
            }
            if !available {
                return Ok(TransformationStatus::InputsUnavailable);
            }
        }
        Ok(TransformationStatus::Runnable)
    }

    /// Runs a transformation by checksum and returns its result.
    ///
    /// A known final result is returned without running, unless in fingertip mode.
    pub async fn run_transformation(
        &self,
        tf_checksum: &Checksum,
        options: RunOptions,
    ) -> Result<Checksum> {
        if let Some((result, false)) = self.get_transformation_result(tf_checksum).await {
            self.register_known_transformation(tf_checksum, &result);
            if !options.fingertip {
                return Ok(result);
            }
        }
        let Some(transformation) = self.get_transformation(tf_checksum).await? else {
            return Err(CacheMiss::new(*tf_checksum).into());
        };
        let mut transformation = (*transformation).clone();
        if let Some(dunder) = &options.dunder {
            transformation.apply_dunder(dunder);
        }
        let holder = self
            .inner
            .holders
            .register(Holder::Transformation(*tf_checksum));
        let incref = self.incref_transformation(&transformation, holder).await;
        let outcome = self.run_held(&incref, &options).await;
        self.decref_transformation(&incref.tf_checksum, holder);
        self.inner.holders.unregister(holder);
        let result = outcome?;
        self.register_known_transformation(tf_checksum, &result);
        Ok(result)
    }

    async fn run_held(&self, incref: &IncrefOutcome, options: &RunOptions) -> Result<Checksum> {
        let tf_checksum = &incref.tf_checksum;
        if let Some(exc) = &incref.exception {
            return Err(exc.clone().into());
        }
        let needs_run = match incref.result {
            None => true,
            Some((_, prelim)) => prelim || options.fingertip,
        };
        if needs_run {
            let job = self
                .run_job(tf_checksum, options.scratch, options.fingertip)
                .await?;
            self.wait_for(job).await?;
        }
        if let Some(exc) = self.transformation_exception(tf_checksum) {
            return Err(exc.into());
        }
        match self.get_transformation_result(tf_checksum).await {
            Some((result, false)) => Ok(result),
            _ => Err(TransformationError::NoResult.into()),
        }
    }

    /// Waits for a job, logging its progress at the poll interval.
    async fn wait_for(&self, job: JobHandle) -> Result<Checksum, TransformationError> {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        let mut finished = pin!(job.clone().finished());
        let mut last = (None, None);
        loop {
            tokio::select! {
                res = &mut finished => return res,
                _ = ticker.tick() => {
                    let progress = job.progress();
                    if progress != last {
                        last = progress;
                        let (progress, prelim) = progress;
                        debug!(tf = %job.tf_checksum(), ?progress, ?prelim, "job progress");
                    }
                }
            }
        }
    }

    /// Contests a recorded result. The local result is forgotten either way.
    pub async fn undo(&self, tf_checksum: &Checksum) -> Result<UndoOutcome> {
        let result = self.get_transformation_result(tf_checksum).await;
        let (removed, known) = {
            let mut state = self.inner.state.lock();
            let known = state.known.remove(tf_checksum);
            if let Some(known) = known {
                if let Some(tfs) = state.known_rev.get_mut(&known) {
                    tfs.retain(|tf| tf != tf_checksum);
                }
            }
            state.logs.remove(tf_checksum);
            (state.results.remove(tf_checksum), known)
        };
        drop(removed);
        let result = match (result, known) {
            (_, Some(known)) => known,
            (Some((result, _)), None) => result,
            (None, None) => return Err(TransformationError::UnknownResult.into()),
        };
        {
            let mut state = self.inner.state.lock();
            if let Some(tfs) = state.results_rev.get_mut(&result) {
                tfs.retain(|tf| tf != tf_checksum);
            }
        }
        match self.inner.database.contest(tf_checksum, &result).await? {
            Some(response) if response.status != 200 => Ok(UndoOutcome::Refused(response.text)),
            _ => Ok(UndoOutcome::Withdrawn(result)),
        }
    }

    /// Cancels every job and forgets everything. Called on shutdown.
    pub fn destroy(&self) {
        let old = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            let held = state
                .entries
                .values()
                .filter(|entry| !entry.holders.is_empty())
                .count();
            if held > 0 {
                warn!("transformation cache, {held} transformations undestroyed");
            }
            std::mem::replace(
                &mut *state,
                State {
                    destroyed: true,
                    ..Default::default()
                },
            )
        };
        for job in old.jobs.into_values() {
            job.task.abort();
        }
    }
}

/// Drives one job: forwards its updates and records its outcome.
#[derive(derive_more::Debug)]
struct JobDriver {
    #[debug(skip)]
    cache: TransformationCache,
    tf_checksum: Checksum,
    updates: mpsc::Receiver<JobUpdate>,
    cancel: CancellationToken,
    #[debug(skip)]
    state_tx: watch::Sender<JobState>,
}

impl JobDriver {
    async fn run(mut self, mut execution: Boxed<Result<ExecutionOutput, TransformationError>>) {
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Err(HardCancelError.into()),
                Some(update) = self.updates.recv() => {
                    self.cache.job_update(&self.tf_checksum, update, &self.state_tx).await;
                }
                res = &mut execution => break res,
            }
        };
        drop(execution);
        self.cache
            .job_done(self.tf_checksum, outcome, &self.state_tx)
            .await;
    }
}

/// Destroys unheld transformations once their keep-alive delay has passed.
#[derive(derive_more::Debug)]
struct KeepAliveActor {
    cache: Weak<Inner>,
    msg_rx: mpsc::UnboundedReceiver<Message>,
    #[debug(skip)]
    queue: DelayQueue<Checksum>,
}

impl KeepAliveActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_msg = self.msg_rx.recv() => {
                    match maybe_msg {
                        Some(Message::KeepAlive { tf_checksum, delay }) => {
                            self.queue.insert(tf_checksum, delay);
                        }
                        None => break,
                    }
                }
                Some(expired) = self.queue.next() => {
                    let tf_checksum = expired.into_inner();
                    let Some(inner) = self.cache.upgrade() else {
                        break;
                    };
                    let cache = TransformationCache { inner };
                    let held = {
                        let state = cache.inner.state.lock();
                        if state.destroyed {
                            break;
                        }
                        state
                            .entries
                            .get(&tf_checksum)
                            .map(|entry| !entry.holders.is_empty())
                    };
                    if held == Some(false) {
                        cache.destroy_transformation(&tf_checksum);
                    }
                }
            }
        }
        debug!("keep-alive actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::{sync::Notify, time::sleep};

    use super::*;
    use crate::{error::Error, test_utils::test_converter, value::Value};

    fn setup(executor: Arc<dyn Executor>) -> (TransformationCache, Converter) {
        setup_with(executor, TransformationConfig::default())
    }

    fn setup_with(
        executor: Arc<dyn Executor>,
        config: TransformationConfig,
    ) -> (TransformationCache, Converter) {
        let conv = test_converter();
        let holders = RefTable::new(conv.buffers().clone());
        let cache = TransformationCache::builder(conv.clone(), Database::inactive(), holders)
            .config(config)
            .executor(executor)
            .build();
        (cache, conv)
    }

    async fn increment_of(conv: &Converter, n: i64) -> Transformation {
        let input = conv.store(&Value::Json(json!(n)), Celltype::Int).await.unwrap();
        Transformation::default()
            .with_pin("a", Pin::new(Celltype::Int, input))
            .with_language("python")
    }

    fn failed(err: impl fmt::Display) -> TransformationError {
        TransformationError::Failed(err.to_string())
    }

    /// Adds one to pin `a`.
    #[derive(Debug, Default)]
    struct Increment {
        runs: AtomicUsize,
    }

    impl Executor for Increment {
        fn execute(
            &self,
            request: ExecutionRequest,
        ) -> Boxed<Result<ExecutionOutput, TransformationError>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let input = request.transformation.pins["a"]
                    .checksum
                    .ok_or_else(|| failed("no input"))?;
                let buffer = request
                    .buffers
                    .get(&input, true)
                    .await
                    .ok_or_else(|| failed("missing input"))?;
                let n: i64 = serde_json::from_slice(&buffer).map_err(failed)?;
                sleep(Duration::from_millis(10)).await;
                let out = Buffer::new(format!("{}\n", n + 1));
                let result = out.checksum();
                request.buffers.cache(&result, out).await;
                Ok(ExecutionOutput {
                    result: Some(result),
                    logs: "incremented\n".to_string(),
                    metadata: None,
                })
            })
        }
    }

    #[derive(Debug)]
    struct Fail;

    impl Executor for Fail {
        fn execute(
            &self,
            _: ExecutionRequest,
        ) -> Boxed<Result<ExecutionOutput, TransformationError>> {
            Box::pin(async { Err(failed("boom")) })
        }
    }

    /// Reports progress and a preliminary result, then waits for the gate.
    #[derive(Debug, Default)]
    struct Gated {
        gate: Arc<Notify>,
    }

    impl Executor for Gated {
        fn execute(
            &self,
            request: ExecutionRequest,
        ) -> Boxed<Result<ExecutionOutput, TransformationError>> {
            let gate = self.gate.clone();
            Box::pin(async move {
                request.reporter.progress(50.0);
                request.reporter.preliminary(Checksum::new(b"prelim\n")).await;
                gate.notified().await;
                Ok(ExecutionOutput {
                    result: Some(Checksum::new(b"final\n")),
                    ..Default::default()
                })
            })
        }
    }

    #[derive(Debug)]
    struct Forever;

    impl Executor for Forever {
        fn execute(
            &self,
            _: ExecutionRequest,
        ) -> Boxed<Result<ExecutionOutput, TransformationError>> {
            Box::pin(futures_lite::future::pending())
        }
    }

    #[test]
    fn identity_ignores_unhashed_fields() -> anyhow::Result<()> {
        let a = Checksum::new(b"1\n");
        let tf = Transformation::default()
            .with_pin("a", Pin::new(Celltype::Int, a))
            .with_language("python");
        let mut decorated = tf.clone();
        decorated.meta = Some(json!({"duration": "short"}));
        decorated.env = Some(Checksum::new(b"env"));
        decorated
            .special
            .insert("SPECIAL__REMOTE".to_string(), json!(true));
        assert_eq!(decorated.checksum(), tf.checksum());

        let text = String::from_utf8(tf.to_buffer().to_vec())?;
        assert_eq!(
            text,
            format!("{{\n  \"__language__\": \"python\",\n  \"a\": [\n    \"int\",\n    null,\n    \"{a}\"\n  ]\n}}\n")
        );

        let back = Transformation::from_json(&decorated.to_json())?;
        assert_eq!(back, decorated);
        assert!(Transformation::from_json(&json!({"a": 1})).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn results_are_cached() -> anyhow::Result<()> {
        let executor = Arc::new(Increment::default());
        let (cache, conv) = setup(executor.clone());
        let tf = increment_of(&conv, 42).await;
        let tf_checksum = tf.checksum();
        conv.buffers().cache(&tf_checksum, tf.to_buffer()).await;

        let result = cache
            .run_transformation(&tf_checksum, RunOptions::default())
            .await?;
        let buffer = conv.buffers().get(&result, false).await.unwrap();
        assert_eq!(&*buffer, b"43\n");
        assert_eq!(
            cache.transformation_logs(&tf_checksum).as_deref(),
            Some("incremented\n")
        );

        let again = cache
            .run_transformation(&tf_checksum, RunOptions::default())
            .await?;
        assert_eq!(again, result);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.transformations_with_result(&result), vec![tf_checksum]);
        assert_eq!(
            cache.transformation_status(&tf_checksum).await?,
            TransformationStatus::Done(result)
        );

        // fingertip mode runs again to regenerate the buffer
        cache
            .run_transformation(
                &tf_checksum,
                RunOptions {
                    fingertip: true,
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn one_job_per_transformation() -> anyhow::Result<()> {
        let executor = Arc::new(Increment::default());
        let (cache, conv) = setup(executor.clone());
        let tf = increment_of(&conv, 1).await;
        let tf_checksum = tf.checksum();
        conv.buffers().cache(&tf_checksum, tf.to_buffer()).await;

        let (a, b) = tokio::join!(
            cache.run_transformation(&tf_checksum, RunOptions::default()),
            cache.run_transformation(&tf_checksum, RunOptions::default()),
        );
        assert_eq!(a?, b?);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn exceptions_are_recorded_and_cleared() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(Fail));
        let tf = increment_of(&conv, 1).await;
        let tf_checksum = tf.checksum();
        conv.buffers().cache(&tf_checksum, tf.to_buffer()).await;

        let err = cache
            .run_transformation(&tf_checksum, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transformation(TransformationError::Failed(ref msg)) if msg == "boom"
        ));
        let status = cache.transformation_status(&tf_checksum).await?;
        assert_eq!(status, TransformationStatus::Exception("boom".to_string()));
        assert_eq!(status.code(), 0);
        assert_eq!(cache.transformation_logs(&tf_checksum).as_deref(), Some("boom"));

        assert!(cache.clear_exception(&tf_checksum));
        assert!(!cache.clear_exception(&tf_checksum));
        assert_eq!(
            cache.transformation_status(&tf_checksum).await?,
            TransformationStatus::Runnable
        );
        Ok(())
    }

    #[tokio::test]
    async fn hard_cancel_stops_the_job() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(Forever));
        let tf = increment_of(&conv, 1).await;
        let holder = cache.holders().register(Holder::Placeholder);
        let incref = cache.incref_transformation(&tf, holder).await;
        let job = cache.run_job(&incref.tf_checksum, false, false).await?;
        assert!(matches!(
            cache.transformation_status(&incref.tf_checksum).await?,
            TransformationStatus::Running { .. }
        ));

        assert!(cache.hard_cancel(&incref.tf_checksum));
        assert_eq!(job.finished().await, Err(HardCancelError.into()));
        assert_eq!(
            cache.transformation_exception(&incref.tf_checksum),
            Some(TransformationError::HardCancel(HardCancelError))
        );
        assert!(!cache.hard_cancel(&incref.tf_checksum));
        Ok(())
    }

    #[tokio::test]
    async fn progress_and_preliminary_results() -> anyhow::Result<()> {
        let executor = Arc::new(Gated::default());
        let (cache, conv) = setup(executor.clone());
        let tf = increment_of(&conv, 1).await;
        let holder = cache.holders().register(Holder::Cell("tf".to_string()));
        let incref = cache.incref_transformation(&tf, holder).await;
        let tf_checksum = incref.tf_checksum;
        let job = cache.run_job(&tf_checksum, false, false).await?;
        // a second request joins the running job
        let same = cache.run_job(&tf_checksum, false, false).await?;

        let prelim = Checksum::new(b"prelim\n");
        tokio::time::timeout(Duration::from_secs(5), async {
            while job.progress().1.is_none() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        assert_eq!(job.progress(), (Some(50.0), Some(prelim)));
        assert_eq!(
            cache.transformation_status(&tf_checksum).await?,
            TransformationStatus::Running {
                progress: Some(50.0),
                prelim: Some(prelim)
            }
        );
        assert_eq!(
            cache.get_transformation_result(&tf_checksum).await,
            Some((prelim, true))
        );

        executor.gate.notify_one();
        let final_result = Checksum::new(b"final\n");
        assert_eq!(same.finished().await, Ok(final_result));
        assert_eq!(
            cache.get_transformation_result(&tf_checksum).await,
            Some((final_result, false))
        );
        assert_eq!(conv.buffers().refcount(&prelim), 0);
        assert_eq!(conv.buffers().refcount(&final_result), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unheld_transformations_are_kept_alive() {
        let (cache, conv) = setup(Arc::new(Increment::default()));
        let tf = increment_of(&conv, 5).await;
        let input = tf.pins["a"].checksum.unwrap();
        let holder = cache.holders().register(Holder::Placeholder);
        let incref = cache.incref_transformation(&tf, holder).await;
        let tf_checksum = incref.tf_checksum;
        assert_eq!(conv.buffers().refcount(&tf_checksum), 1);
        assert_eq!(conv.buffers().refcount(&input), 1);

        assert!(cache.decref_transformation(&tf_checksum, holder));
        assert!(!cache.decref_transformation(&tf_checksum, holder));
        sleep(Duration::from_millis(500)).await;
        assert!(cache.local_transformation(&tf_checksum).is_some());

        sleep(Duration::from_millis(600)).await;
        assert!(cache.local_transformation(&tf_checksum).is_none());
        assert_eq!(conv.buffers().refcount(&tf_checksum), 0);
        assert_eq!(conv.buffers().refcount(&input), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_holder_keeps_the_transformation() {
        let (cache, conv) = setup(Arc::new(Increment::default()));
        let tf = increment_of(&conv, 5).await;
        let first = cache.holders().register(Holder::Placeholder);
        let second = cache.holders().register(Holder::Placeholder);
        let incref = cache.incref_transformation(&tf, first).await;
        cache.decref_transformation(&incref.tf_checksum, first);
        cache.incref_transformation(&tf, second).await;
        sleep(Duration::from_secs(2)).await;
        assert!(cache.local_transformation(&incref.tf_checksum).is_some());
    }

    #[tokio::test]
    async fn undo_forgets_the_result() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(Increment::default()));
        let tf = increment_of(&conv, 2).await;
        let tf_checksum = tf.checksum();
        conv.buffers().cache(&tf_checksum, tf.to_buffer()).await;
        let result = cache
            .run_transformation(&tf_checksum, RunOptions::default())
            .await?;

        assert_eq!(cache.undo(&tf_checksum).await?, UndoOutcome::Withdrawn(result));
        assert_eq!(cache.get_transformation_result(&tf_checksum).await, None);
        assert_eq!(cache.transformations_with_result(&result), vec![]);
        let err = cache.undo(&tf_checksum).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown transformation result");
        Ok(())
    }

    #[tokio::test]
    async fn status_of_unknown_and_unavailable() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(Increment::default()));
        let unknown = cache.transformation_status(&Checksum::new(b"nothing")).await?;
        assert_eq!(unknown, TransformationStatus::Unknown);
        assert_eq!(unknown.code(), -3);

        let tf = Transformation::default()
            .with_pin("a", Pin::new(Celltype::Int, Checksum::new(b"7\n")))
            .with_language("python");
        let holder = cache.holders().register(Holder::Placeholder);
        let incref = cache.incref_transformation(&tf, holder).await;
        let status = cache.transformation_status(&incref.tf_checksum).await?;
        assert_eq!(status, TransformationStatus::InputsUnavailable);
        assert_eq!(status.code(), -2);

        conv.buffers().cache(&Checksum::new(b"7\n"), Buffer::from("7\n")).await;
        let status = cache.transformation_status(&incref.tf_checksum).await?;
        assert_eq!(status.code(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stateless_results_are_not_kept() -> anyhow::Result<()> {
        let config = TransformationConfig {
            stateless: true,
            ..Default::default()
        };
        let (cache, conv) = setup_with(Arc::new(Increment::default()), config);
        let tf = increment_of(&conv, 3).await;
        let holder = cache.holders().register(Holder::Placeholder);
        let incref = cache.incref_transformation(&tf, holder).await;
        let job = cache.run_job(&incref.tf_checksum, false, false).await?;
        let result = job.finished().await?;
        assert_eq!(&*conv.buffers().get(&result, false).await.unwrap(), b"4\n");
        assert_eq!(cache.get_transformation_result(&incref.tf_checksum).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn syntactic_to_semantic_checksums() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(NoExecutor));
        let buffers = conv.buffers();
        let code_a = Buffer::from("def f():\n    return 1   \n\n\n");
        let code_b = Buffer::from("def f():\n\n    return 1\n");
        buffers.cache(&code_a.checksum(), code_a.clone()).await;
        buffers.cache(&code_b.checksum(), code_b.clone()).await;

        let sem_a = cache
            .syntactic_to_semantic(&code_a.checksum(), Celltype::Python, None, "f")
            .await?;
        let sem_b = cache
            .syntactic_to_semantic(&code_b.checksum(), Celltype::Python, None, "f")
            .await?;
        assert_eq!(sem_a, sem_b);
        assert_eq!(sem_a, Checksum::new(b"def f():\n    return 1\n"));
        let key = SemKey::new(sem_a, Celltype::Python, None);
        assert_eq!(
            cache.semantic_to_syntactic(&key).await,
            Some(vec![code_a.checksum(), code_b.checksum()])
        );

        let cson = Buffer::from("{\"b\": 2, \"a\": 1}\n");
        buffers.cache(&cson.checksum(), cson.clone()).await;
        let sem = cache
            .syntactic_to_semantic(&cson.checksum(), Celltype::Cson, None, "config")
            .await?;
        assert_eq!(sem, Checksum::new(json_dumps(&json!({"a": 1, "b": 2}))));

        let plain = Checksum::new(b"1\n");
        assert_eq!(
            cache
                .syntactic_to_semantic(&plain, Celltype::Plain, None, "x")
                .await?,
            plain
        );
        Ok(())
    }

    #[tokio::test]
    async fn semantic_inputs_need_their_syntax() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(NoExecutor));
        let code = Buffer::from("x = 1\n");
        conv.buffers().cache(&code.checksum(), code.clone()).await;
        let sem = Checksum::new(b"x = 1\n");
        let tf = Transformation::default()
            .with_pin("code", Pin::new(Celltype::Python, sem))
            .with_language("python");
        let err = cache.build_semantic_cache(&tf).await.unwrap_err();
        assert_eq!(
            err,
            TransformationError::UnknownSemantic {
                checksum: sem,
                celltype: Celltype::Python
            }
        );

        cache
            .syntactic_to_semantic(&code.checksum(), Celltype::Python, None, "code")
            .await?;
        let semantic_cache = cache.build_semantic_cache(&tf).await?;
        assert_eq!(
            semantic_cache.get(&SemKey::new(sem, Celltype::Python, None)),
            Some(&vec![code.checksum()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn without_an_executor_jobs_fail() -> anyhow::Result<()> {
        let (cache, conv) = setup(Arc::new(NoExecutor));
        let tf = increment_of(&conv, 1).await;
        let tf_checksum = tf.checksum();
        conv.buffers().cache(&tf_checksum, tf.to_buffer()).await;
        let err = cache
            .run_transformation(&tf_checksum, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transformation(TransformationError::NoExecutor(c)) if c == tf_checksum
        ));
        Ok(())
    }
}
