//! Static classification of celltype conversions.
//!
//! Every ordered pair of distinct celltypes belongs to exactly one [`Conversion`] class. Pairs
//! without a direct rule are either mapped to an equivalent pair, or routed through a
//! mandatory intermediate celltype. [`resolve_chain`] expands both into the sequence of
//! direct steps.

use std::sync::LazyLock;

use crate::{celltype::Celltype, checksum::Checksum};

/// How a conversion between two celltypes behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Source and target are the same celltype.
    Identity,
    /// Checksum unchanged, always valid.
    Trivial,
    /// Checksum unchanged, but the buffer must be checked.
    Reinterpret,
    /// Deterministic rewrite of the buffer, valid for any valid input.
    Reformat,
    /// Value dependent rewrite that may fail.
    Possible,
    /// Requires the full value, done through a value conversion callback.
    Value,
    /// Never allowed.
    Forbidden,
    /// Handled exactly like another pair.
    Equivalent(Celltype, Celltype),
    /// Must go through the given intermediate celltype.
    Chain(Celltype),
}

/// Result of attempting a conversion without doing all possible work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The converted buffer has this checksum.
    Converted(Checksum),
    /// The conversion succeeds and keeps the checksum.
    Unchanged,
    /// The conversion will succeed, but the result is not known yet.
    Pending,
    /// It is not known whether the conversion can succeed.
    Undetermined,
    /// The conversion cannot succeed.
    Impossible,
}

impl Outcome {
    /// Returns true unless more work may still settle the outcome.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Outcome::Pending | Outcome::Undetermined)
    }
}

use Celltype as C;

const TRIVIAL: &[(Celltype, Celltype)] = &[
    (C::Text, C::Bytes),
    (C::Ipython, C::Text),
    (C::Python, C::Text),
    (C::Python, C::Ipython),
    (C::Cson, C::Text),
    (C::Yaml, C::Text),
    (C::Plain, C::Cson),
    (C::Plain, C::Yaml),
    (C::Plain, C::Bytes),
    (C::Binary, C::Mixed),
    (C::Plain, C::Mixed),
    (C::Str, C::Plain),
    (C::Int, C::Plain),
    (C::Float, C::Plain),
    (C::Bool, C::Plain),
];

/// Reverses of the trivial conversions that are not reinterpretations.
const NOT_REINTERPRET: &[(Celltype, Celltype)] = &[
    (C::Ipython, C::Python),
    (C::Cson, C::Plain),
    (C::Yaml, C::Plain),
    (C::Plain, C::Str),
    (C::Plain, C::Int),
    (C::Plain, C::Float),
    (C::Plain, C::Bool),
];

const REFORMAT: &[(Celltype, Celltype)] = &[
    (C::Bytes, C::Binary),
    (C::Bytes, C::Mixed),
    (C::Binary, C::Bytes),
    (C::Mixed, C::Bytes),
    (C::Plain, C::Text),
    (C::Text, C::Plain),
    (C::Text, C::Str),
    (C::Str, C::Text),
    (C::Cson, C::Plain),
    (C::Yaml, C::Plain),
    (C::Ipython, C::Python),
    (C::Int, C::Str),
    (C::Float, C::Str),
    (C::Bool, C::Str),
    (C::Int, C::Float),
    (C::Bool, C::Int),
    (C::Float, C::Int),
    (C::Int, C::Bool),
    (C::Float, C::Bool),
    (C::Bool, C::Float),
];

const POSSIBLE: &[(Celltype, Celltype)] = &[
    (C::Binary, C::Int),
    (C::Binary, C::Float),
    (C::Binary, C::Bool),
    (C::Str, C::Int),
    (C::Str, C::Float),
    (C::Str, C::Bool),
    (C::Plain, C::Str),
    (C::Plain, C::Int),
    (C::Plain, C::Float),
    (C::Plain, C::Bool),
    (C::Mixed, C::Str),
    (C::Mixed, C::Int),
    (C::Mixed, C::Float),
    (C::Mixed, C::Bool),
];

const EQUIVALENT: &[((Celltype, Celltype), (Celltype, Celltype))] = &[
    // text subtypes to str, never through plain
    ((C::Cson, C::Str), (C::Text, C::Str)),
    ((C::Yaml, C::Str), (C::Text, C::Str)),
    ((C::Text, C::Mixed), (C::Text, C::Str)),
    ((C::Cson, C::Mixed), (C::Text, C::Str)),
    ((C::Yaml, C::Mixed), (C::Text, C::Str)),
    ((C::Python, C::Str), (C::Text, C::Str)),
    ((C::Ipython, C::Str), (C::Text, C::Str)),
    ((C::Python, C::Mixed), (C::Text, C::Str)),
    ((C::Ipython, C::Mixed), (C::Text, C::Str)),
    ((C::Python, C::Plain), (C::Text, C::Str)),
    ((C::Ipython, C::Plain), (C::Text, C::Str)),
    // str to text subtypes
    ((C::Str, C::Cson), (C::Str, C::Text)),
    ((C::Str, C::Yaml), (C::Str, C::Text)),
    ((C::Str, C::Python), (C::Str, C::Text)),
    ((C::Str, C::Ipython), (C::Str, C::Text)),
    // specific converter, generalized output
    ((C::Python, C::Bytes), (C::Python, C::Text)),
    ((C::Ipython, C::Bytes), (C::Ipython, C::Text)),
    ((C::Str, C::Mixed), (C::Str, C::Binary)),
    ((C::Int, C::Mixed), (C::Int, C::Plain)),
    ((C::Float, C::Mixed), (C::Float, C::Plain)),
    ((C::Bool, C::Mixed), (C::Bool, C::Plain)),
    // generic converter, specific input
    ((C::Str, C::Binary), (C::Plain, C::Binary)),
    ((C::Float, C::Binary), (C::Plain, C::Binary)),
    ((C::Int, C::Binary), (C::Plain, C::Binary)),
    ((C::Bool, C::Binary), (C::Plain, C::Binary)),
    ((C::Python, C::Binary), (C::Text, C::Binary)),
    ((C::Ipython, C::Binary), (C::Text, C::Binary)),
    ((C::Cson, C::Bytes), (C::Text, C::Bytes)),
    ((C::Yaml, C::Bytes), (C::Text, C::Bytes)),
    ((C::Str, C::Bytes), (C::Plain, C::Bytes)),
    ((C::Int, C::Bytes), (C::Plain, C::Bytes)),
    ((C::Float, C::Bytes), (C::Plain, C::Bytes)),
    ((C::Bool, C::Bytes), (C::Plain, C::Bytes)),
    ((C::Int, C::Text), (C::Plain, C::Text)),
    ((C::Float, C::Text), (C::Plain, C::Text)),
    ((C::Bool, C::Text), (C::Plain, C::Text)),
];

/// `(a, c) -> b`: convert a to b, then b to c.
const CHAIN: &[((Celltype, Celltype), Celltype)] = &[
    ((C::Mixed, C::Text), C::Plain),
    ((C::Mixed, C::Cson), C::Text),
    ((C::Mixed, C::Yaml), C::Text),
    ((C::Mixed, C::Ipython), C::Text),
    ((C::Mixed, C::Python), C::Text),
    ((C::Binary, C::Text), C::Plain),
    ((C::Binary, C::Cson), C::Text),
    ((C::Binary, C::Yaml), C::Text),
    ((C::Binary, C::Ipython), C::Text),
    ((C::Binary, C::Python), C::Text),
    ((C::Bytes, C::Str), C::Plain),
    ((C::Bytes, C::Float), C::Plain),
    ((C::Bytes, C::Int), C::Plain),
    ((C::Bytes, C::Bool), C::Plain),
    ((C::Bytes, C::Cson), C::Text),
    ((C::Bytes, C::Yaml), C::Text),
    ((C::Bytes, C::Ipython), C::Text),
    ((C::Bytes, C::Python), C::Text),
    ((C::Binary, C::Str), C::Bytes),
    ((C::Plain, C::Python), C::Text),
    ((C::Plain, C::Ipython), C::Text),
    ((C::Text, C::Binary), C::Mixed),
    ((C::Text, C::Float), C::Plain),
    ((C::Text, C::Int), C::Plain),
    ((C::Text, C::Bool), C::Plain),
    ((C::Cson, C::Binary), C::Plain),
    ((C::Yaml, C::Binary), C::Plain),
    ((C::Cson, C::Yaml), C::Plain),
    ((C::Yaml, C::Cson), C::Plain),
    ((C::Cson, C::Int), C::Plain),
    ((C::Cson, C::Float), C::Plain),
    ((C::Cson, C::Bool), C::Plain),
    ((C::Yaml, C::Int), C::Plain),
    ((C::Yaml, C::Float), C::Plain),
    ((C::Yaml, C::Bool), C::Plain),
    ((C::Int, C::Cson), C::Plain),
    ((C::Int, C::Yaml), C::Plain),
    ((C::Float, C::Cson), C::Plain),
    ((C::Float, C::Yaml), C::Plain),
    ((C::Bool, C::Cson), C::Plain),
    ((C::Bool, C::Yaml), C::Plain),
];

const VALUE: &[(Celltype, Celltype)] = &[(C::Binary, C::Plain), (C::Plain, C::Binary)];

const FORBIDDEN: &[(Celltype, Celltype)] = &[
    (C::Python, C::Cson),
    (C::Python, C::Yaml),
    (C::Python, C::Int),
    (C::Python, C::Float),
    (C::Python, C::Bool),
    (C::Ipython, C::Cson),
    (C::Ipython, C::Yaml),
    (C::Ipython, C::Int),
    (C::Ipython, C::Float),
    (C::Ipython, C::Bool),
    (C::Cson, C::Python),
    (C::Cson, C::Ipython),
    (C::Yaml, C::Python),
    (C::Yaml, C::Ipython),
    (C::Int, C::Python),
    (C::Int, C::Ipython),
    (C::Float, C::Python),
    (C::Float, C::Ipython),
    (C::Bool, C::Python),
    (C::Bool, C::Ipython),
];

type Table = [[Option<Conversion>; Celltype::COUNT]; Celltype::COUNT];

/// Every class a pair was listed in. Used to build the table and to check it.
fn listings(source: Celltype, target: Celltype) -> Vec<Conversion> {
    let pair = (source, target);
    let mut found = Vec::new();
    if source == target {
        found.push(Conversion::Identity);
    }
    if TRIVIAL.contains(&pair) {
        found.push(Conversion::Trivial);
    }
    if TRIVIAL.contains(&(target, source)) && !NOT_REINTERPRET.contains(&pair) {
        found.push(Conversion::Reinterpret);
    }
    if REFORMAT.contains(&pair) {
        found.push(Conversion::Reformat);
    }
    if POSSIBLE.contains(&pair) {
        found.push(Conversion::Possible);
    }
    if VALUE.contains(&pair)
        || (source != target && (source == C::Checksum || target == C::Checksum))
    {
        found.push(Conversion::Value);
    }
    if FORBIDDEN.contains(&pair) {
        found.push(Conversion::Forbidden);
    }
    for (from, to) in EQUIVALENT {
        if *from == pair {
            found.push(Conversion::Equivalent(to.0, to.1));
        }
    }
    for (from, via) in CHAIN {
        if *from == pair {
            found.push(Conversion::Chain(*via));
        }
    }
    found
}

static TABLE: LazyLock<Table> = LazyLock::new(|| {
    let mut table = [[None; Celltype::COUNT]; Celltype::COUNT];
    for source in Celltype::all() {
        for target in Celltype::all() {
            table[source.index()][target.index()] = listings(source, target).first().copied();
        }
    }
    table
});

/// Classifies the conversion from `source` to `target`.
pub fn conversion(source: Celltype, target: Celltype) -> Conversion {
    TABLE[source.index()][target.index()].unwrap_or(Conversion::Forbidden)
}

/// Follows equivalences for a single step.
///
/// Returns the pair whose rule applies.
pub fn canonical(source: Celltype, target: Celltype) -> (Celltype, Celltype) {
    let mut pair = (source, target);
    while let Conversion::Equivalent(s, t) = conversion(pair.0, pair.1) {
        pair = (s, t);
    }
    pair
}

/// Expands a conversion into the list of celltypes to step through, ending with `target`.
///
/// When an equivalence changes the source celltype, the new source is inserted as a step.
pub fn resolve_chain(source: Celltype, target: Celltype) -> Vec<Celltype> {
    let mut chain = Vec::new();
    let mut source = source;
    let mut pair = (source, target);
    while let Conversion::Equivalent(s, t) = conversion(pair.0, pair.1) {
        pair = (s, t);
        if pair.0 != source {
            source = pair.0;
            chain.push(source);
        }
    }
    match conversion(pair.0, pair.1) {
        Conversion::Chain(intermediate) => {
            chain.extend(resolve_chain(source, intermediate));
            chain.extend(resolve_chain(intermediate, target));
        }
        _ => chain.push(target),
    }
    chain
}

/// Checks that every pair is listed exactly once and that no equivalence or chain loops.
///
/// Returns a description of each problem found.
pub fn check_table() -> Vec<String> {
    let mut problems = Vec::new();
    for source in Celltype::all() {
        for target in Celltype::all() {
            if source == target {
                continue;
            }
            let mut pair = (source, target);
            let mut seen = vec![pair];
            loop {
                let found = listings(pair.0, pair.1);
                match found.len() {
                    0 => {
                        problems.push(format!("missing conversion: {pair:?}"));
                        break;
                    }
                    1 => {}
                    _ => {
                        problems.push(format!("duplicate conversion: {pair:?} in {found:?}"));
                        break;
                    }
                }
                pair = match found[0] {
                    Conversion::Equivalent(s, t) => (s, t),
                    Conversion::Chain(via) => (via, pair.1),
                    _ => break,
                };
                if seen.contains(&pair) {
                    problems.push(format!("circular equivalence: {pair:?}"));
                    break;
                }
                seen.push(pair);
            }
        }
    }
    problems
}
