//! Aggregation point of [`Collector`]s.

use std::{
    collections::{BTreeMap, HashMap},
    fmt, iter,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel as channel;
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::RwLock;

use crate::{
    core::{Collector, Metric},
    desc::{self, is_valid_label_name, is_valid_metric_name, Labels},
    proto::{LabelPair, MetricFamily, MetricKind, Sample},
    Error, Result,
};

/// Default cap on the number of threads collecting metrics concurrently
/// during a single [`Registry::gather()`].
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Result of [`Registry::gather()`].
///
/// Errors of some collectors or families never prevent the others from being
/// gathered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gathered {
    /// Successfully gathered families, sorted by name.
    pub families: Vec<MetricFamily>,

    /// Problems encountered while gathering.
    pub errors: Vec<Error>,
}

/// Registered state of a [`Registry`].
#[derive(Default)]
struct State {
    /// Registered [`Collector`]s by their IDs (XOR of their [`Desc::id()`]s).
    ///
    /// [`Desc::id()`]: crate::Desc::id
    collectors: FnvHashMap<u64, Arc<dyn Collector>>,

    /// [`Desc::id()`]s of all the registered [`Collector`]s.
    ///
    /// [`Desc::id()`]: crate::Desc::id
    desc_ids: FnvHashSet<u64>,

    /// [`Dims`] of every registered metric name.
    dims: HashMap<String, Dims>,
}

/// Shape of a registered metric name, shared by all its [`Desc`]s.
///
/// [`Desc`]: crate::Desc
struct Dims {
    /// [`Desc::dim_hash()`] of the name.
    ///
    /// [`Desc::dim_hash()`]: crate::Desc::dim_hash
    hash: u64,

    help: String,

    /// Number of registered [`Desc`]s referring the name.
    ///
    /// [`Desc`]: crate::Desc
    refs: usize,
}

/// Registration-relevant parts of a [`Desc`].
///
/// [`Desc`]: crate::Desc
struct DescInfo {
    id: u64,
    name: String,
    help: String,
    dim_hash: u64,
}

struct Inner {
    state: RwLock<State>,

    /// Prefix of all the gathered family names.
    prefix: Option<String>,

    /// Labels attached to all the gathered samples, sorted by name.
    labels: Vec<LabelPair>,

    /// Cap on the number of collecting threads.
    max_workers: usize,

    /// Deadline for all the collectors to respond.
    gather_timeout: Option<Duration>,
}

/// Registry of [`Collector`]s, gathering their [`Metric`]s into
/// [`MetricFamily`]s.
///
/// Cloning a [`Registry`] is cheap and yields a handle to the same registry.
///
/// # Example
///
/// ```rust
/// use metrics_gatherer::{proto, Gauge, Opts, Registry};
///
/// let registry = Registry::new();
///
/// let a = Gauge::new(Opts::new("test_gauge", "help").const_label("env", "a"));
/// let b = Gauge::new(Opts::new("test_gauge", "help").const_label("env", "b"));
/// registry.register(Box::new(a.clone()))?;
/// registry.register(Box::new(b.clone()))?;
/// a.set(1.0);
/// b.set(2.0);
///
/// let gathered = registry.gather();
/// assert!(gathered.errors.is_empty());
/// assert_eq!(gathered.families.len(), 1);
/// assert_eq!(gathered.families[0].samples[1].value, proto::Value::Gauge(2.0));
/// # Ok::<_, metrics_gatherer::Error>(())
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("collectors", &self.inner.state.read().collectors.len())
            .field("prefix", &self.inner.prefix)
            .field("labels", &self.inner.labels)
            .field("max_workers", &self.inner.max_workers)
            .field("gather_timeout", &self.inner.gather_timeout)
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates a new empty [`Registry`] with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::from_builder(Builder::default())
    }

    /// Starts building a new [`Registry`] with custom settings.
    pub fn builder() -> Builder {
        Builder::default()
    }

    fn from_builder(b: Builder) -> Self {
        let mut labels = b
            .labels
            .into_iter()
            .map(|(k, v)| LabelPair::new(k, v))
            .collect::<Vec<_>>();
        labels.sort();
        Self {
            inner: Arc::new(Inner {
                state: RwLock::default(),
                prefix: b.prefix,
                labels,
                max_workers: b.max_workers,
                gather_timeout: b.gather_timeout,
            }),
        }
    }

    /// Registers the provided [`Collector`] in this [`Registry`].
    ///
    /// Either all the [`Desc`]s of the [`Collector`] are registered, or none.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDescriptor`] if any [`Desc`] is malformed, or uses a
    ///   label attached by this [`Registry`] to all samples.
    /// - [`Error::DuplicateDescriptor`] if any [`Desc`] is registered already.
    /// - [`Error::InconsistentDimensions`] if any [`Desc`] has a metric name
    ///   registered already with a different set of label names.
    /// - [`Error::InconsistentHelp`] if any [`Desc`] has a metric name
    ///   registered already with a different help.
    /// - [`Error::EmptyCollector`] if the [`Collector`] describes nothing.
    ///
    /// [`Desc`]: crate::Desc
    pub fn register(&self, c: Box<dyn Collector>) -> Result<()> {
        // `Collector::desc()` is a user code, so is called outside the lock.
        let descs = self.checked_descs(&*c)?;

        let mut state = self.inner.state.write();

        let mut collector_id = 0;
        let mut new_dims = HashMap::<&str, (u64, &str)>::new();
        for d in &descs {
            if state.desc_ids.contains(&d.id) {
                return Err(Error::DuplicateDescriptor(d.name.clone()));
            }
            collector_id ^= d.id;

            let known = state
                .dims
                .get(&d.name)
                .map(|dims| (dims.hash, dims.help.as_str()))
                .or_else(|| new_dims.get(d.name.as_str()).copied());
            match known {
                Some((hash, _)) if hash != d.dim_hash => {
                    return Err(Error::InconsistentDimensions(d.name.clone()));
                }
                Some((_, help)) if help != d.help => {
                    return Err(Error::InconsistentHelp(d.name.clone()));
                }
                Some(_) => {}
                None => drop(new_dims.insert(&d.name, (d.dim_hash, &d.help))),
            }
        }
        if state.collectors.contains_key(&collector_id) {
            // Unreachable for non-colliding hashes, as the `desc_ids` check
            // above catches it first.
            let name = descs.first().map(|d| d.name.clone());
            return Err(Error::DuplicateDescriptor(name.unwrap_or_default()));
        }

        for d in &descs {
            _ = state.desc_ids.insert(d.id);
            state
                .dims
                .entry(d.name.clone())
                .or_insert_with(|| Dims {
                    hash: d.dim_hash,
                    help: d.help.clone(),
                    refs: 0,
                })
                .refs += 1;
        }
        drop(state.collectors.insert(collector_id, Arc::from(c)));
        drop(state);

        tracing::debug!(
            collector_id,
            descs = descs.len(),
            "registered metrics collector",
        );
        Ok(())
    }

    /// Registers the provided [`Collector`] in this [`Registry`].
    ///
    /// # Panics
    ///
    /// If the [`Collector`] fails to be registered. Intended for startup-time
    /// wiring, where misconfigured instrumentation is a programming error.
    pub fn must_register(&self, c: Box<dyn Collector>) {
        self.register(c).unwrap_or_else(|e| {
            panic!("failed to register metrics collector: {e}")
        });
    }

    /// Unregisters the provided [`Collector`] (or the one describing the very
    /// same [`Desc`]s) from this [`Registry`], freeing its [`Desc`]s.
    ///
    /// Returns whether the [`Collector`] was registered.
    ///
    /// An in-flight [`Registry::gather()`] may still collect it once.
    ///
    /// [`Desc`]: crate::Desc
    pub fn unregister(&self, c: &dyn Collector) -> bool {
        let descs = unique_descs(c);
        let collector_id = descs.iter().fold(0, |acc, d| acc ^ d.id);

        let mut state = self.inner.state.write();
        if state.collectors.remove(&collector_id).is_none() {
            return false;
        }
        for d in &descs {
            _ = state.desc_ids.remove(&d.id);
            let freed = state.dims.get_mut(&d.name).map_or(false, |dims| {
                dims.refs -= 1;
                dims.refs == 0
            });
            if freed {
                drop(state.dims.remove(&d.name));
            }
        }
        drop(state);

        tracing::debug!(collector_id, "unregistered metrics collector");
        true
    }

    /// Collects [`Metric`]s of all the registered [`Collector`]s concurrently
    /// and merges them into [`MetricFamily`]s.
    ///
    /// Returns once every [`Collector`] has responded (or the configured
    /// [`Builder::gather_timeout()`] elapses). A failing [`Collector`] or an
    /// inconsistent family is reported in [`Gathered::errors`], while all the
    /// others are still returned.
    #[must_use]
    pub fn gather(&self) -> Gathered {
        let (mut collectors, dims) = {
            let state = self.inner.state.read();
            let collectors = state
                .collectors
                .iter()
                .map(|(id, c)| (*id, Arc::clone(c)))
                .collect::<Vec<_>>();
            let dims = state
                .dims
                .iter()
                .map(|(n, dims)| (n.clone(), dims.hash))
                .collect::<HashMap<_, _>>();
            (collectors, dims)
        };
        if collectors.is_empty() {
            return Gathered::default();
        }
        // Results are merged in this order, regardless of the order they
        // arrive in.
        collectors.sort_unstable_by_key(|(id, _)| *id);

        let mut merger = Merger::new(dims);
        let mut collected = iter::repeat_with(|| None)
            .take(collectors.len())
            .collect::<Vec<Option<Result<_, ()>>>>();

        let (results_tx, results_rx) = channel::unbounded();
        let (jobs_tx, jobs_rx) = channel::unbounded();
        for (i, (_, c)) in collectors.iter().enumerate() {
            _ = jobs_tx.send((i, Arc::clone(c)));
        }
        drop(jobs_tx);

        let workers = collectors.len().min(self.inner.max_workers).max(1);
        let mut spawned = 0;
        for n in 0..workers {
            let (jobs, results) = (jobs_rx.clone(), results_tx.clone());
            let res = thread::Builder::new()
                .name(format!("metrics-gather-{n}"))
                .spawn(move || collect_jobs(&jobs, &results));
            match res {
                Ok(_) => spawned += 1,
                Err(e) => {
                    tracing::warn!("failed to spawn gathering thread: {e}");
                }
            }
        }
        if spawned == 0 {
            // No threads are available, so collect on the calling one.
            collect_jobs(&jobs_rx, &results_tx);
        }
        drop(results_tx);

        let deadline = self.inner.gather_timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        for _ in 0..collectors.len() {
            let res = match deadline {
                Some(d) => {
                    results_rx.recv_deadline(d).map_err(|e| e.is_timeout())
                }
                None => results_rx.recv().map_err(|_| false),
            };
            match res {
                Ok((i, res)) => collected[i] = Some(res),
                Err(is_timeout) => {
                    timed_out = is_timeout;
                    break;
                }
            }
        }
        for (res, (_, c)) in collected.into_iter().zip(&collectors) {
            match res {
                Some(Ok(metrics)) => merger.merge(metrics),
                Some(Err(())) => {
                    merger.errors.push(Error::CollectorFailed(names(&**c)));
                }
                None if timed_out => {
                    merger.errors.push(Error::GatherTimeout(names(&**c)));
                }
                None => merger.errors.push(Error::CollectorFailed(names(&**c))),
            }
        }
        if timed_out {
            tracing::warn!(
                timeout = ?self.inner.gather_timeout,
                "metrics gathering timed out",
            );
        }

        let gathered =
            merger.finish(self.inner.prefix.as_deref(), &self.inner.labels);
        tracing::debug!(
            collectors = collectors.len(),
            families = gathered.families.len(),
            errors = gathered.errors.len(),
            "gathered metrics",
        );
        gathered
    }

    /// Validates [`Desc`]s of the provided [`Collector`], returning them
    /// deduplicated by ID.
    ///
    /// [`Desc`]: crate::Desc
    fn checked_descs(&self, c: &dyn Collector) -> Result<Vec<DescInfo>> {
        let descs = c.desc();
        if descs.is_empty() {
            return Err(Error::EmptyCollector);
        }
        for d in &descs {
            d.validity().map_err(Clone::clone)?;

            let clash = self.inner.labels.iter().find(|l| {
                d.const_label_pairs().iter().any(|p| p.name == l.name)
                    || d.variable_labels().iter().any(|n| *n == l.name)
            });
            if let Some(l) = clash {
                return Err(Error::InvalidDescriptor {
                    name: d.fq_name().to_owned(),
                    reason: format!(
                        "label `{}` is attached by the registry already",
                        l.name,
                    ),
                });
            }
        }
        Ok(unique_descs(c))
    }
}

/// Returns [`Desc`]s of the provided [`Collector`], deduplicated by ID.
///
/// [`Desc`]: crate::Desc
fn unique_descs(c: &dyn Collector) -> Vec<DescInfo> {
    let mut seen = FnvHashSet::default();
    c.desc()
        .into_iter()
        .filter(|d| seen.insert(d.id()))
        .map(|d| DescInfo {
            id: d.id(),
            name: d.fq_name().to_owned(),
            help: d.help().to_owned(),
            dim_hash: d.dim_hash(),
        })
        .collect()
}

/// Returns metric names described by the provided [`Collector`].
fn names(c: &dyn Collector) -> Vec<String> {
    c.desc().into_iter().map(|d| d.fq_name().to_owned()).collect()
}

/// Outcome of collecting a single [`Collector`].
type Collected = (usize, Result<Vec<Box<dyn Metric>>, ()>);

/// Collects queued [`Collector`]s until the `jobs` queue is drained, or the
/// `results` are not awaited anymore.
fn collect_jobs(
    jobs: &channel::Receiver<(usize, Arc<dyn Collector>)>,
    results: &channel::Sender<Collected>,
) {
    while let Ok((i, c)) = jobs.recv() {
        let res = panic::catch_unwind(AssertUnwindSafe(|| c.collect()))
            .map_err(drop);
        if results.send((i, res)).is_err() {
            break;
        }
    }
}

/// [`MetricFamily`] being assembled.
struct Family {
    help: String,
    kind: MetricKind,
    dim_hash: u64,
    samples: Vec<Sample>,

    /// Whether the family is dropped due to inconsistent metrics.
    dropped: bool,
}

/// Groups collected [`Metric`]s into [`MetricFamily`]s, validating them.
struct Merger {
    /// Registered dimension hashes by metric name.
    dims: HashMap<String, u64>,
    families: BTreeMap<String, Family>,

    /// IDs of the invalid [`Desc`]s reported already.
    ///
    /// [`Desc`]: crate::Desc
    invalid: FnvHashSet<u64>,

    errors: Vec<Error>,
}

impl Merger {
    fn new(dims: HashMap<String, u64>) -> Self {
        Self {
            dims,
            families: BTreeMap::new(),
            invalid: FnvHashSet::default(),
            errors: Vec::new(),
        }
    }

    fn merge(&mut self, metrics: Vec<Box<dyn Metric>>) {
        for m in metrics {
            let desc = m.desc();
            if let Err(e) = desc.validity() {
                if self.invalid.insert(desc.id()) {
                    self.errors.push(e.clone());
                }
                continue;
            }
            let name = desc.fq_name();
            let sample = m.render();
            let sample_dims = desc::dim_hash(
                name,
                sample.labels.iter().map(|l| l.name.as_str()),
            );

            let dims = &self.dims;
            let family =
                self.families.entry(name.to_owned()).or_insert_with(|| Family {
                    help: desc.help().to_owned(),
                    kind: sample.value.kind(),
                    dim_hash: dims.get(name).copied().unwrap_or(sample_dims),
                    samples: Vec::new(),
                    dropped: false,
                });
            if family.dropped {
                continue;
            }
            if family.kind != sample.value.kind() {
                family.dropped = true;
                self.errors.push(Error::InconsistentKind {
                    name: name.to_owned(),
                    expected: family.kind,
                    got: sample.value.kind(),
                });
            } else if family.dim_hash != sample_dims {
                family.dropped = true;
                self.errors
                    .push(Error::InconsistentDimensions(name.to_owned()));
            } else if family.help != desc.help() {
                family.dropped = true;
                self.errors.push(Error::InconsistentHelp(name.to_owned()));
            } else {
                family.samples.push(sample);
            }
        }
    }

    fn finish(
        mut self,
        prefix: Option<&str>,
        labels: &[LabelPair],
    ) -> Gathered {
        let mut families = Vec::with_capacity(self.families.len());
        for (name, f) in self.families {
            if f.dropped {
                continue;
            }
            let mut samples = f.samples;
            // Stable, so the duplicate collected first (in the order of
            // collector IDs) survives.
            samples.sort_by(|a, b| a.labels.cmp(&b.labels));
            let mut deduped = Vec::<Sample>::with_capacity(samples.len());
            for s in samples {
                let last = deduped.last();
                if last.map_or(false, |prev| prev.labels == s.labels) {
                    self.errors.push(Error::DuplicateSample {
                        name: name.clone(),
                        labels: s.labels_string(),
                    });
                    continue;
                }
                deduped.push(s);
            }

            if !labels.is_empty() {
                for s in &mut deduped {
                    s.labels.extend_from_slice(labels);
                    s.labels.sort();
                }
            }
            families.push(MetricFamily {
                name: match prefix {
                    Some(p) => format!("{p}_{name}"),
                    None => name,
                },
                help: f.help,
                kind: f.kind,
                samples: deduped,
            });
        }
        Gathered { families, errors: self.errors }
    }
}

/// Builder of a [`Registry`] with custom settings.
#[derive(Clone, Debug)]
#[must_use]
pub struct Builder {
    prefix: Option<String>,
    labels: Labels,
    max_workers: usize,
    gather_timeout: Option<Duration>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            prefix: None,
            labels: Labels::new(),
            max_workers: DEFAULT_MAX_WORKERS,
            gather_timeout: None,
        }
    }
}

impl Builder {
    /// Sets the prefix of all the gathered family names, joined with `_`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Adds a label attached to all the gathered samples.
    pub fn label(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        drop(self.labels.insert(name.into(), value.into()));
        self
    }

    /// Sets the cap on the number of threads collecting metrics concurrently.
    ///
    /// Default is [`DEFAULT_MAX_WORKERS`]. Zero is treated as one.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    /// Sets the deadline for all the collectors to respond on
    /// [`Registry::gather()`].
    ///
    /// Collectors not responding in time are reported as
    /// [`Error::GatherTimeout`]s, and their late results are discarded.
    pub fn gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = Some(timeout);
        self
    }

    /// Builds the [`Registry`].
    ///
    /// # Errors
    ///
    /// With [`Error::InvalidDescriptor`] if the prefix isn't a valid metric
    /// name, or any label name is invalid.
    pub fn build(self) -> Result<Registry> {
        if let Some(p) = &self.prefix {
            if !is_valid_metric_name(p) {
                return Err(Error::InvalidDescriptor {
                    name: p.clone(),
                    reason: "registry prefix is not a valid metric name".into(),
                });
            }
        }
        let invalid = |n: &&String| {
            !is_valid_label_name(n)
                || n.starts_with(desc::RESERVED_LABEL_PREFIX)
        };
        if let Some(n) = self.labels.keys().find(invalid) {
            return Err(Error::InvalidDescriptor {
                name: self.prefix.clone().unwrap_or_default(),
                reason: format!("registry label name `{n}` is invalid"),
            });
        }
        Ok(Registry::from_builder(self))
    }
}
