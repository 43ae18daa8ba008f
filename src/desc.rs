//! Immutable identity of a metric.

use std::{collections::HashMap, fmt, hash::Hasher as _};

use fnv::FnvHasher;

use crate::{proto::LabelPair, Error, Result};

/// Mapping of label names to their values.
pub type Labels = HashMap<String, String>;

/// Prefix of label names reserved for internal use.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// Separator byte never appearing in valid UTF-8, used when hashing sequences
/// of strings.
const SEPARATOR: u8 = 0xff;

/// Descriptor of a metric: its fully-qualified name, help, const labels and
/// variable label names.
///
/// [`Desc`] construction never fails: any misuse is captured inside and
/// returned by [`Desc::validity()`] once the [`Desc`] is registered or
/// gathered.
///
/// # Example
///
/// ```rust
/// use metrics_gatherer::Desc;
///
/// let ok = Desc::new(
///     "requests_total",
///     "Requests.",
///     [("service", "api")],
///     ["method"],
/// );
/// assert!(ok.validity().is_ok());
///
/// let bad = Desc::new("requests_total", "Requests.", [("le", "1")], ["le"]);
/// assert!(bad.validity().is_err());
/// ```
#[derive(Clone, Debug)]
pub struct Desc {
    /// Fully-qualified name of the metric.
    fq_name: String,

    /// Help text of the metric.
    help: String,

    /// Const label pairs, sorted by name.
    const_label_pairs: Vec<LabelPair>,

    /// Variable label names in the caller-defined order.
    variable_labels: Vec<String>,

    /// Hash of the metric identity: `fq_name`, const label pairs and variable
    /// label names.
    id: u64,

    /// Hash of the metric dimensions: `fq_name` and the set of all label
    /// names.
    dim_hash: u64,

    /// Captured construction error, if any.
    validity: Result<()>,
}

impl Desc {
    /// Creates a new [`Desc`] out of the provided parts.
    ///
    /// Any problem with them is captured and returned by
    /// [`Desc::validity()`].
    pub fn new<C, K, V, L, N>(
        fq_name: impl Into<String>,
        help: impl Into<String>,
        const_labels: C,
        variable_labels: L,
    ) -> Self
    where
        C: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        L: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let fq_name = fq_name.into();
        let help = help.into();
        let mut const_label_pairs = const_labels
            .into_iter()
            .map(|(k, v)| LabelPair::new(k, v))
            .collect::<Vec<_>>();
        const_label_pairs.sort();
        let variable_labels =
            variable_labels.into_iter().map(Into::into).collect::<Vec<_>>();

        let validity =
            validate(&fq_name, &help, &const_label_pairs, &variable_labels);

        let mut sorted_variable = variable_labels.iter().collect::<Vec<_>>();
        sorted_variable.sort();
        let mut h = FnvHasher::default();
        write_str(&mut h, &fq_name);
        for p in &const_label_pairs {
            write_str(&mut h, &p.name);
            write_str(&mut h, &p.value);
        }
        for n in sorted_variable {
            write_str(&mut h, n);
        }
        let id = h.finish();

        let dim_hash = dim_hash(
            &fq_name,
            const_label_pairs
                .iter()
                .map(|p| p.name.as_str())
                .chain(variable_labels.iter().map(String::as_str)),
        );

        Self {
            fq_name,
            help,
            const_label_pairs,
            variable_labels,
            id,
            dim_hash,
            validity,
        }
    }

    /// Returns the fully-qualified name of the metric.
    #[must_use]
    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    /// Returns the help text of the metric.
    #[must_use]
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Returns the const label pairs of the metric, sorted by name.
    #[must_use]
    pub fn const_label_pairs(&self) -> &[LabelPair] {
        &self.const_label_pairs
    }

    /// Returns the variable label names of the metric, in their declared
    /// order.
    #[must_use]
    pub fn variable_labels(&self) -> &[String] {
        &self.variable_labels
    }

    /// Returns the identity hash of the metric.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the dimensions hash of the metric.
    #[must_use]
    pub const fn dim_hash(&self) -> u64 {
        self.dim_hash
    }

    /// Returns the error captured while constructing this [`Desc`], if any.
    ///
    /// # Errors
    ///
    /// With [`Error::InvalidDescriptor`] if this [`Desc`] is malformed.
    pub fn validity(&self) -> Result<(), &Error> {
        self.validity.as_ref().map(|_| ())
    }

    /// Returns a copy of this [`Desc`] with the `help` text replaced.
    ///
    /// Neither the [`Desc::id()`] nor the [`Desc::dim_hash()`] change.
    #[must_use]
    pub fn with_help(&self, help: impl Into<String>) -> Self {
        Self { help: help.into(), ..self.clone() }
    }

    /// Marks this [`Desc`] as invalid for the provided `reason`, unless it's
    /// invalid already.
    pub(crate) fn invalidate(mut self, reason: impl Into<String>) -> Self {
        if self.validity.is_ok() {
            self.validity = Err(Error::InvalidDescriptor {
                name: self.fq_name.clone(),
                reason: reason.into(),
            });
        }
        self
    }

    /// Merges the const label pairs with the provided variable label `values`
    /// into a single list sorted by name.
    ///
    /// # Errors
    ///
    /// With [`Error::UnmatchedLabels`] if the number of `values` differs from
    /// the number of variable labels.
    pub(crate) fn label_pairs(
        &self,
        values: &[&str],
    ) -> Result<Vec<LabelPair>> {
        if values.len() != self.variable_labels.len() {
            return Err(Error::unmatched(&self.variable_labels, values));
        }
        let mut pairs = self
            .const_label_pairs
            .iter()
            .cloned()
            .chain(
                self.variable_labels
                    .iter()
                    .zip(values)
                    .map(|(n, v)| LabelPair::new(n.as_str(), *v)),
            )
            .collect::<Vec<_>>();
        pairs.sort();
        Ok(pairs)
    }
}

impl fmt::Display for Desc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let consts = self
            .const_label_pairs
            .iter()
            .map(|p| format!("{}={:?}", p.name, p.value))
            .collect::<Vec<_>>();
        write!(
            f,
            "Desc{{fq_name: {:?}, help: {:?}, const_labels: {{{}}}, \
             variable_labels: {:?}}}",
            self.fq_name,
            self.help,
            consts.join(","),
            self.variable_labels,
        )
    }
}

/// Computes the dimensions hash of the metric `name` with the provided set of
/// `label_names` (in any order).
pub(crate) fn dim_hash<'a>(
    name: &str,
    label_names: impl IntoIterator<Item = &'a str>,
) -> u64 {
    let mut names = label_names.into_iter().collect::<Vec<_>>();
    names.sort_unstable();

    let mut h = FnvHasher::default();
    write_str(&mut h, name);
    for n in names {
        write_str(&mut h, n);
    }
    h.finish()
}

/// Hashes the provided ordered label `values`.
pub(crate) fn hash_values<S: AsRef<str>>(values: &[S]) -> u64 {
    let mut h = FnvHasher::default();
    for v in values {
        write_str(&mut h, v.as_ref());
    }
    h.finish()
}

fn write_str(h: &mut FnvHasher, s: &str) {
    h.write(s.as_bytes());
    h.write_u8(SEPARATOR);
}

/// Checks whether `name` is a valid metric name.
#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(
        chars.next(),
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':'
    )
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Checks whether `name` is a valid label name. Reserved names are considered
/// valid here.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate(
    fq_name: &str,
    help: &str,
    const_label_pairs: &[LabelPair],
    variable_labels: &[String],
) -> Result<()> {
    let invalid = |reason: String| {
        Err(Error::InvalidDescriptor { name: fq_name.to_owned(), reason })
    };

    if help.is_empty() {
        return invalid("help is empty".into());
    }
    if !is_valid_metric_name(fq_name) {
        return invalid(format!("`{fq_name}` is not a valid metric name"));
    }

    let mut seen = HashMap::new();
    let names = const_label_pairs
        .iter()
        .map(|p| (p.name.as_str(), "const"))
        .chain(variable_labels.iter().map(|n| (n.as_str(), "variable")));
    for (name, kind) in names {
        if !is_valid_label_name(name) {
            return invalid(format!(
                "{kind} label name `{name}` is not a valid label name",
            ));
        }
        if name.starts_with(RESERVED_LABEL_PREFIX) {
            return invalid(format!(
                "{kind} label name `{name}` is reserved",
            ));
        }
        if let Some(prev) = seen.insert(name, kind) {
            return invalid(format!(
                "{kind} label name `{name}` duplicates a {prev} one",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_consts() -> [(&'static str, &'static str); 0] {
        []
    }

    #[test]
    fn validates_names() {
        assert!(is_valid_metric_name("ns:sub_name9"));
        assert!(is_valid_metric_name("_x"));
        assert!(!is_valid_metric_name("9x"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("a-b"));

        assert!(is_valid_label_name("le"));
        assert!(!is_valid_label_name("a:b"));
        assert!(!is_valid_label_name("1a"));
    }

    #[test]
    fn captures_errors_instead_of_failing() {
        let cases = [
            Desc::new("x", "", no_consts(), ["a"]),
            Desc::new("1x", "help", no_consts(), ["a"]),
            Desc::new("x", "help", no_consts(), ["a", "a"]),
            Desc::new("x", "help", [("a", "1")], ["a"]),
            Desc::new("x", "help", no_consts(), ["__value__"]),
            Desc::new("x", "help", [("bad-name", "1")], ["a"]),
        ];
        for desc in cases {
            assert!(
                matches!(
                    desc.validity(),
                    Err(Error::InvalidDescriptor { .. }),
                ),
                "expected {desc} to be invalid",
            );
        }

        assert!(Desc::new("x", "help", [("b", "1")], ["a"]).validity().is_ok());
    }

    #[test]
    fn const_label_values_change_id_but_not_dimensions() {
        let a = Desc::new("test_gauge", "help", [("env", "a")], ["x"]);
        let b = Desc::new("test_gauge", "help", [("env", "b")], ["x"]);

        assert_ne!(a.id(), b.id());
        assert_eq!(a.dim_hash(), b.dim_hash());
    }

    #[test]
    fn label_names_change_dimensions() {
        let a = Desc::new("test_gauge", "help", no_consts(), ["x"]);
        let b = Desc::new("test_gauge", "help", no_consts(), ["y"]);
        let c = Desc::new("test_gauge", "help", [("x", "1")], ["y"]);

        assert_ne!(a.dim_hash(), b.dim_hash());
        assert_ne!(b.dim_hash(), c.dim_hash());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn help_is_not_part_of_identity() {
        let a = Desc::new("x", "one", no_consts(), ["l"]);
        let b = a.with_help("two");

        assert_eq!(b.help(), "two");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.dim_hash(), b.dim_hash());
    }

    #[test]
    fn merges_label_pairs_sorted() {
        let d = Desc::new("x", "help", [("b", "2")], ["c", "a"]);

        let pairs = d.label_pairs(&["3", "1"]).unwrap();
        assert_eq!(
            pairs,
            vec![
                LabelPair::new("a", "1"),
                LabelPair::new("b", "2"),
                LabelPair::new("c", "3"),
            ],
        );

        assert!(matches!(
            d.label_pairs(&["3"]),
            Err(Error::UnmatchedLabels { .. }),
        ));
    }
}
