//! Families of metrics partitioned by label values.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use fnv::FnvHashMap;
use parking_lot::RwLock;
use sealed::sealed;
use smallvec::SmallVec;

use crate::{
    core::{Collector, Metric},
    desc::hash_values,
    histogram,
    proto::{LabelPair, MetricKind},
    value::Value,
    Counter, Desc, Error, Gauge, Histogram, HistogramOpts, Opts, Result,
    Untyped,
};

/// [`MetricVec`] of [`Counter`]s.
pub type CounterVec = MetricVec<Counter>;

/// [`MetricVec`] of [`Gauge`]s.
pub type GaugeVec = MetricVec<Gauge>;

/// [`MetricVec`] of [`Histogram`]s.
pub type HistogramVec = MetricVec<Histogram>;

/// [`MetricVec`] of [`Untyped`] metrics.
pub type UntypedVec = MetricVec<Untyped>;

/// Metric able to be a child of a [`MetricVec`].
#[sealed]
pub trait Child: Metric + Clone + fmt::Debug + 'static {
    /// Parameters shared by all the children of a [`MetricVec`].
    #[doc(hidden)]
    type Template: fmt::Debug + Send + Sync;

    /// Creates a new zeroed child.
    #[doc(hidden)]
    fn create(
        desc: &Arc<Desc>,
        labels: Vec<LabelPair>,
        template: &Self::Template,
    ) -> Self;
}

#[sealed]
impl Child for Counter {
    type Template = ();

    fn create(desc: &Arc<Desc>, labels: Vec<LabelPair>, _: &()) -> Self {
        let desc = Arc::clone(desc);
        Self(Arc::new(Value::new(desc, MetricKind::Counter, labels)))
    }
}

#[sealed]
impl Child for Gauge {
    type Template = ();

    fn create(desc: &Arc<Desc>, labels: Vec<LabelPair>, _: &()) -> Self {
        Self(Arc::new(Value::new(Arc::clone(desc), MetricKind::Gauge, labels)))
    }
}

#[sealed]
impl Child for Untyped {
    type Template = ();

    fn create(desc: &Arc<Desc>, labels: Vec<LabelPair>, _: &()) -> Self {
        let desc = Arc::clone(desc);
        Self(Arc::new(Value::new(desc, MetricKind::Untyped, labels)))
    }
}

#[sealed]
impl Child for Histogram {
    type Template = Arc<[f64]>;

    fn create(
        desc: &Arc<Desc>,
        labels: Vec<LabelPair>,
        bounds: &Arc<[f64]>,
    ) -> Self {
        Self(Arc::new(histogram::Core::new(
            Arc::clone(desc),
            labels,
            Arc::clone(bounds),
        )))
    }
}

/// Children sharing the same hash of their label values.
type Bucket<M> = SmallVec<[(Box<[String]>, M); 1]>;

/// Storage shared by a [`MetricVec`] and all of its curried views.
#[derive(Debug)]
struct Core<M: Child> {
    /// [`Desc`] shared by all the children.
    desc: Arc<Desc>,

    /// Parameters of newly created children.
    template: M::Template,

    /// Children keyed by the hash of their label values.
    children: RwLock<FnvHashMap<u64, Bucket<M>>>,
}

/// Family of `M`etrics sharing the same [`Desc`], but partitioned by the
/// values of its variable labels.
///
/// Children are created lazily, on first access to their label values.
/// Cloning a [`MetricVec`] is cheap and yields a handle to the same children.
///
/// # Example
///
/// ```rust
/// use std::collections::HashMap;
///
/// use metrics_gatherer::{GaugeVec, Opts};
///
/// let deletes = GaugeVec::new(
///     Opts::new("deletes", "Delete operations.")
///         .variable_labels(["corpus", "qos"]),
/// );
///
/// // Compact, but order-sensitive.
/// deletes.get_or_create(&["profile-pictures", "immediate"])?.set(4.0);
/// // More verbose, but order doesn't matter.
/// deletes
///     .get_or_create_by_name(&HashMap::from([
///         ("qos", "lazy"),
///         ("corpus", "cat-memes"),
///     ]))?
///     .set(1.0);
///
/// assert_eq!(deletes.children().len(), 2);
/// # Ok::<_, metrics_gatherer::Error>(())
/// ```
pub struct MetricVec<M: Child> {
    /// Storage of the children.
    core: Arc<Core<M>>,

    /// Positions of the curried variable labels with their fixed values,
    /// ascending by position.
    curried: Arc<[(usize, String)]>,
}

// Manual implementation is required to omit the redundant `M: Clone` trait
// bound imposed by `#[derive(Clone)]`.
impl<M: Child> Clone for MetricVec<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            curried: Arc::clone(&self.curried),
        }
    }
}

impl<M: Child> fmt::Debug for MetricVec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricVec")
            .field("desc", &self.core.desc)
            .field("curried", &self.curried)
            .finish_non_exhaustive()
    }
}

impl MetricVec<Counter> {
    /// Creates a new [`CounterVec`] out of the provided [`Opts`].
    ///
    /// Errors in the [`Opts`] are reported on registration.
    #[must_use]
    pub fn new(opts: Opts) -> Self {
        Self::with_desc(opts.vec_desc(), ())
    }
}

impl MetricVec<Gauge> {
    /// Creates a new [`GaugeVec`] out of the provided [`Opts`].
    ///
    /// Errors in the [`Opts`] are reported on registration.
    #[must_use]
    pub fn new(opts: Opts) -> Self {
        Self::with_desc(opts.vec_desc(), ())
    }
}

impl MetricVec<Untyped> {
    /// Creates a new [`UntypedVec`] out of the provided [`Opts`].
    ///
    /// Errors in the [`Opts`] are reported on registration.
    #[must_use]
    pub fn new(opts: Opts) -> Self {
        Self::with_desc(opts.vec_desc(), ())
    }
}

impl MetricVec<Histogram> {
    /// Creates a new [`HistogramVec`] out of the provided [`HistogramOpts`].
    ///
    /// Errors in the [`HistogramOpts`] are reported on registration.
    #[must_use]
    pub fn new(opts: HistogramOpts) -> Self {
        let (desc, bounds) =
            histogram::check(opts.common.vec_desc(), &opts.buckets);
        Self::with_desc(desc, bounds)
    }
}

impl<M: Child> MetricVec<M> {
    fn with_desc(desc: Desc, template: M::Template) -> Self {
        Self {
            core: Arc::new(Core {
                desc: Arc::new(desc),
                template,
                children: RwLock::default(),
            }),
            curried: Arc::new([]),
        }
    }

    /// Returns the [`Desc`] shared by all the children of this [`MetricVec`].
    #[must_use]
    pub fn desc(&self) -> &Desc {
        &self.core.desc
    }

    /// Returns the child with the provided variable label `values` (in the
    /// declared order of the variable labels, omitting the curried ones),
    /// creating a zeroed one if there is none yet.
    ///
    /// At most one child exists for the same `values`, even if many callers
    /// request it concurrently for the first time.
    ///
    /// # Errors
    ///
    /// With [`Error::UnmatchedLabels`] if the number of `values` doesn't match
    /// the number of (non-curried) variable labels.
    pub fn get_or_create(&self, values: &[&str]) -> Result<M> {
        let full = self.full_values(values)?;
        self.get_or_create_full(&full)
    }

    /// Returns the child with the provided `labels` (mapping of variable
    /// label names to their values), creating a zeroed one if there is none
    /// yet.
    ///
    /// # Errors
    ///
    /// With [`Error::UnmatchedLabels`] if the `labels` miss or add any
    /// (non-curried) variable label.
    pub fn get_or_create_by_name<K, V, S>(
        &self,
        labels: &HashMap<K, V, S>,
    ) -> Result<M>
    where
        K: Borrow<str> + Eq + Hash,
        V: AsRef<str>,
        S: BuildHasher,
    {
        let values = self.values_by_name(labels)?;
        self.get_or_create(&values)
    }

    /// Removes the child with the provided variable label `values`.
    ///
    /// Returns whether a child was removed. Accessing the same `values` later
    /// creates a fresh zeroed child.
    pub fn remove(&self, values: &[&str]) -> bool {
        let Ok(full) = self.full_values(values) else {
            return false;
        };
        let hash = hash_values(&full);

        let mut children = self.core.children.write();
        let Some(bucket) = children.get_mut(&hash) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|(v, _)| equal(v, &full))
        else {
            return false;
        };
        drop(bucket.remove(pos));
        if bucket.is_empty() {
            drop(children.remove(&hash));
        }
        true
    }

    /// Removes the child with the provided `labels` (mapping of variable
    /// label names to their values).
    ///
    /// Returns whether a child was removed.
    pub fn remove_by_name<K, V, S>(&self, labels: &HashMap<K, V, S>) -> bool
    where
        K: Borrow<str> + Eq + Hash,
        V: AsRef<str>,
        S: BuildHasher,
    {
        self.values_by_name(labels).map_or(false, |v| self.remove(&v))
    }

    /// Removes all the children visible through this [`MetricVec`].
    pub fn reset(&self) {
        let mut children = self.core.children.write();
        if self.curried.is_empty() {
            children.clear();
        } else {
            children.retain(|_, bucket| {
                bucket.retain(|(v, _)| !self.matches_curried(v));
                !bucket.is_empty()
            });
        }
    }

    /// Returns a view of this [`MetricVec`] with the provided `labels` fixed
    /// to their values.
    ///
    /// The view shares its children with this [`MetricVec`]: children created
    /// through it are visible here, and vice versa.
    ///
    /// # Errors
    ///
    /// With [`Error::UnmatchedLabels`] if any of the `labels` isn't a
    /// (non-curried) variable label of this [`MetricVec`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::collections::HashMap;
    ///
    /// use metrics_gatherer::{CounterVec, Opts};
    ///
    /// let requests = CounterVec::new(
    ///     Opts::new("requests_total", "Requests.")
    ///         .variable_labels(["method", "code"]),
    /// );
    /// let gets = requests.curry(&HashMap::from([("method", "GET")]))?;
    ///
    /// gets.get_or_create(&["200"])?.inc();
    /// assert_eq!(requests.get_or_create(&["GET", "200"])?.get(), 1.0);
    /// # Ok::<_, metrics_gatherer::Error>(())
    /// ```
    pub fn curry<K, V, S>(&self, labels: &HashMap<K, V, S>) -> Result<Self>
    where
        K: Borrow<str> + Eq + Hash,
        V: AsRef<str>,
        S: BuildHasher,
    {
        let names = self.core.desc.variable_labels();
        let mut curried = self.curried.to_vec();
        for (name, value) in labels {
            let name: &str = name.borrow();
            let pos = names
                .iter()
                .position(|n| n == name)
                .filter(|p| !curried.iter().any(|(c, _)| c == p))
                .ok_or_else(|| {
                    Error::unmatched(
                        self.uncurried_names(),
                        labels.keys().map(key_str),
                    )
                })?;
            curried.push((pos, value.as_ref().to_owned()));
        }
        curried.sort_unstable_by_key(|(p, _)| *p);

        Ok(Self { core: Arc::clone(&self.core), curried: curried.into() })
    }

    /// Returns a snapshot of all the children visible through this
    /// [`MetricVec`], taken at a single point in time.
    #[must_use]
    pub fn children(&self) -> Vec<M> {
        let children = self.core.children.read();
        children
            .values()
            .flatten()
            .filter(|(v, _)| self.matches_curried(v))
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn get_or_create_full(&self, full: &[&str]) -> Result<M> {
        let hash = hash_values(full);

        if let Some(m) = self.lookup(hash, full) {
            return Ok(m);
        }

        let mut children = self.core.children.write();
        let bucket = children.entry(hash).or_default();
        if let Some((_, m)) = bucket.iter().find(|(v, _)| equal(v, full)) {
            return Ok(m.clone());
        }
        let labels = self.core.desc.label_pairs(full)?;
        let m = M::create(&self.core.desc, labels, &self.core.template);
        bucket.push((
            full.iter().map(|v| (*v).to_owned()).collect(),
            m.clone(),
        ));
        Ok(m)
    }

    fn lookup(&self, hash: u64, full: &[&str]) -> Option<M> {
        let children = self.core.children.read();
        children
            .get(&hash)?
            .iter()
            .find(|(v, _)| equal(v, full))
            .map(|(_, m)| m.clone())
    }

    /// Merges the provided non-curried `values` with the curried ones.
    fn full_values<'a>(
        &'a self,
        values: &[&'a str],
    ) -> Result<SmallVec<[&'a str; 8]>> {
        let total = self.core.desc.variable_labels().len();
        if values.len() + self.curried.len() != total {
            return Err(Error::unmatched(self.uncurried_names(), values));
        }

        let mut full = SmallVec::with_capacity(total);
        let mut rest = values.iter();
        let mut curried = self.curried.iter().peekable();
        for pos in 0..total {
            match curried.peek().copied() {
                Some((p, v)) if *p == pos => {
                    full.push(v.as_str());
                    _ = curried.next();
                }
                _ => full.extend(rest.next().copied()),
            }
        }
        Ok(full)
    }

    /// Orders the values of the provided `labels` by the non-curried variable
    /// labels.
    fn values_by_name<'m, K, V, S>(
        &self,
        labels: &'m HashMap<K, V, S>,
    ) -> Result<SmallVec<[&'m str; 8]>>
    where
        K: Borrow<str> + Eq + Hash,
        V: AsRef<str>,
        S: BuildHasher,
    {
        let unmatched = || {
            Error::unmatched(self.uncurried_names(), labels.keys().map(key_str))
        };

        let names = self.uncurried_names();
        if names.len() != labels.len() {
            return Err(unmatched());
        }
        names
            .into_iter()
            .map(|n| labels.get(n).map(value_str).ok_or_else(unmatched))
            .collect()
    }

    fn uncurried_names(&self) -> Vec<&str> {
        self.core
            .desc
            .variable_labels()
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.curried.iter().any(|(p, _)| p == i))
            .map(|(_, n)| n.as_str())
            .collect()
    }

    fn matches_curried(&self, values: &[String]) -> bool {
        self.curried.iter().all(|(p, v)| values.get(*p) == Some(v))
    }
}

fn equal(stored: &[String], values: &[&str]) -> bool {
    stored.len() == values.len()
        && stored.iter().zip(values).all(|(s, v)| s == v)
}

fn key_str<K: Borrow<str>>(k: &K) -> &str {
    k.borrow()
}

fn value_str<V: AsRef<str>>(v: &V) -> &str {
    v.as_ref()
}

impl<M: Child> Collector for MetricVec<M> {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        self.children()
            .into_iter()
            .map(|m| Box::new(m) as Box<dyn Metric>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Barrier},
        thread,
    };

    use proptest::prelude::*;

    use super::*;
    use crate::proto;

    fn deletes() -> GaugeVec {
        GaugeVec::new(
            Opts::new("deletes", "Delete operations.")
                .const_label("binary_version", "debug")
                .variable_labels(["corpus", "qos"]),
        )
    }

    #[test]
    fn creates_children_lazily_and_reuses_them() {
        let vec = deletes();
        assert!(vec.children().is_empty());

        vec.get_or_create(&["profile-pictures", "immediate"]).unwrap().set(4.0);
        vec.get_or_create(&["profile-pictures", "immediate"]).unwrap().add(1.0);

        let children = vec.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].get(), 5.0);
        assert_eq!(
            Metric::render(&children[0]).labels,
            vec![
                LabelPair::new("binary_version", "debug"),
                LabelPair::new("corpus", "profile-pictures"),
                LabelPair::new("qos", "immediate"),
            ],
        );
    }

    #[test]
    fn label_order_is_significant_for_values() {
        let vec = deletes();
        vec.get_or_create(&["a", "b"]).unwrap().inc();
        vec.get_or_create(&["b", "a"]).unwrap().inc();

        assert_eq!(vec.children().len(), 2);
    }

    #[test]
    fn by_name_is_order_independent() {
        let vec = deletes();
        vec.get_or_create(&["cat-memes", "lazy"]).unwrap().set(1.0);

        let g = vec
            .get_or_create_by_name(&HashMap::from([
                ("qos", "lazy"),
                ("corpus", "cat-memes"),
            ]))
            .unwrap();
        assert_eq!(g.get(), 1.0);
    }

    #[test]
    fn rejects_unmatched_labels() {
        let vec = deletes();

        assert!(matches!(
            vec.get_or_create_by_name(&HashMap::from([("corpus", "x")])),
            Err(Error::UnmatchedLabels { .. }),
        ));
        assert!(matches!(
            vec.get_or_create_by_name(&HashMap::from([
                ("corpus", "x"),
                ("qos", "y"),
                ("extra", "z"),
            ])),
            Err(Error::UnmatchedLabels { .. }),
        ));
        assert!(matches!(
            vec.get_or_create_by_name(&HashMap::from([
                ("corpus", "x"),
                ("other", "y"),
            ])),
            Err(Error::UnmatchedLabels { .. }),
        ));
        assert!(matches!(
            vec.get_or_create(&["x"]),
            Err(Error::UnmatchedLabels { .. }),
        ));
        assert!(vec.children().is_empty());
    }

    #[test]
    fn recreates_removed_children_zeroed() {
        let vec = deletes();
        vec.get_or_create(&["a", "b"]).unwrap().set(42.0);

        assert!(vec.remove(&["a", "b"]));
        assert!(!vec.remove(&["a", "b"]));
        assert!(vec.children().is_empty());

        assert_eq!(vec.get_or_create(&["a", "b"]).unwrap().get(), 0.0);

        assert!(vec.remove_by_name(&HashMap::from([("qos", "b"), ("corpus", "a")])));
        assert!(!vec.remove_by_name(&HashMap::from([("qos", "b")])));
    }

    #[test]
    fn removed_child_is_not_resurrected() {
        let vec = deletes();
        let old = vec.get_or_create(&["a", "b"]).unwrap();
        old.set(7.0);
        assert!(vec.remove(&["a", "b"]));

        // Writes through a stale handle don't reach the new child.
        old.set(8.0);
        assert_eq!(vec.get_or_create(&["a", "b"]).unwrap().get(), 0.0);
    }

    #[test]
    fn no_variable_labels_means_single_child() {
        let vec = CounterVec::new(Opts::new("c", "help"));
        vec.get_or_create(&[]).unwrap().inc();
        vec.get_or_create_by_name(&HashMap::<&str, &str>::new())
            .unwrap()
            .inc();

        let children = vec.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].get(), 2.0);
    }

    #[test]
    fn curried_view_shares_storage() {
        let vec = deletes();
        let lazy = vec.curry(&HashMap::from([("qos", "lazy")])).unwrap();

        lazy.get_or_create(&["cat-memes"]).unwrap().set(3.0);
        vec.get_or_create(&["dog-memes", "immediate"]).unwrap().set(1.0);

        assert_eq!(vec.get_or_create(&["cat-memes", "lazy"]).unwrap().get(), 3.0);
        assert_eq!(vec.children().len(), 2);
        assert_eq!(lazy.children().len(), 1);

        assert!(matches!(
            lazy.curry(&HashMap::from([("qos", "again")])),
            Err(Error::UnmatchedLabels { .. }),
        ));
        assert!(matches!(
            vec.curry(&HashMap::from([("unknown", "x")])),
            Err(Error::UnmatchedLabels { .. }),
        ));

        let both = lazy.curry(&HashMap::from([("corpus", "cat-memes")])).unwrap();
        assert_eq!(both.get_or_create(&[]).unwrap().get(), 3.0);

        lazy.reset();
        assert_eq!(vec.children().len(), 1);
        assert!(lazy.children().is_empty());
    }

    #[test]
    fn histogram_vec_shares_buckets() {
        let vec = HistogramVec::new(
            HistogramOpts::new("h", "help")
                .buckets(vec![1.0])
                .variable_labels(["route"]),
        );
        vec.get_or_create(&["/"]).unwrap().observe(0.5);
        vec.get_or_create(&["/a"]).unwrap().observe(2.0);

        for child in vec.children() {
            let proto::Value::Histogram { count, buckets, .. } =
                Metric::render(&child).value
            else {
                panic!("expected histogram");
            };
            assert_eq!(count, 1);
            assert_eq!(buckets.len(), 1);
        }
    }

    #[test]
    fn concurrent_first_access_creates_single_child() {
        let vec = CounterVec::new(
            Opts::new("c", "help").variable_labels(["l"]),
        );
        let start = Barrier::new(16);

        thread::scope(|s| {
            for _ in 0..16 {
                _ = s.spawn(|| {
                    _ = start.wait();
                    for _ in 0..100 {
                        vec.get_or_create(&["same"]).unwrap().inc();
                    }
                });
            }
        });

        let children = vec.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].get(), 1600.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn converges_per_label(n in any::<u32>()) {
            let mutations = (n % 1000) as usize;
            let conc_level = (n % 15 + 1) as usize;
            let vec_length = (n % 5 + 1) as usize;

            let vec = GaugeVec::new(
                Opts::new("test_gauge", "no help can be found here")
                    .variable_labels(["label"]),
            );
            let names = (0..vec_length)
                .map(|i| char::from(b'A' + i as u8).to_string())
                .collect::<Vec<_>>();
            let (tx, rx) = mpsc::channel::<(usize, f64)>();
            let start = Barrier::new(conc_level);

            thread::scope(|s| {
                for t in 0..conc_level {
                    let (tx, vec, names, start) = (tx.clone(), &vec, &names, &start);
                    _ = s.spawn(move || {
                        _ = start.wait();
                        for j in 0..mutations {
                            let seed = t * 31 + j * 17;
                            let i = seed % vec_length;
                            let v = ((seed % 1000) as f64) / 1000.0 - 0.5;
                            tx.send((i, v)).unwrap();
                            vec.get_or_create(&[names[i].as_str()]).unwrap().add(v);
                        }
                    });
                }
            });
            drop(tx);

            let mut expected = vec![0.0; vec_length];
            for (i, v) in rx.iter() {
                expected[i] += v;
            }
            for (i, name) in names.iter().enumerate() {
                let got = vec.get_or_create(&[name.as_str()]).unwrap().get();
                prop_assert!((expected[i] - got).abs() < 0.000_001);
            }
        }
    }
}
