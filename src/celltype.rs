//! Representation kinds of cell buffers.

use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

/// How the bytes of a buffer decode into a value.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::EnumCount,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Celltype {
    Text,
    Python,
    Ipython,
    Cson,
    Yaml,
    Str,
    Bytes,
    #[strum(to_string = "mixed", serialize = "silk")]
    #[serde(alias = "silk")]
    Mixed,
    Binary,
    Plain,
    Int,
    Float,
    Bool,
    Checksum,
}

impl Celltype {
    /// Number of celltypes.
    pub const COUNT: usize = <Self as EnumCount>::COUNT;

    /// All celltypes, in declaration order.
    pub fn all() -> impl Iterator<Item = Celltype> {
        Self::iter()
    }

    /// Position of the celltype in the conversion table.
    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Celltypes whose buffer is UTF-8 text without JSON quoting.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Celltype::Text | Celltype::Python | Celltype::Ipython | Celltype::Cson | Celltype::Yaml
        )
    }

    /// Celltypes whose value is a JSON scalar.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Celltype::Str | Celltype::Int | Celltype::Float | Celltype::Bool
        )
    }

    /// Returns false for celltypes that have a semantic checksum distinct from their
    /// syntactic one.
    pub fn syntactic_is_semantic(self) -> bool {
        !matches!(self, Celltype::Cson | Celltype::Yaml | Celltype::Python)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("mixed".parse::<Celltype>().unwrap(), Celltype::Mixed);
        assert_eq!("silk".parse::<Celltype>().unwrap(), Celltype::Mixed);
        assert_eq!(Celltype::Mixed.to_string(), "mixed");
        assert_eq!(Celltype::Ipython.to_string(), "ipython");
        assert!("numpy".parse::<Celltype>().is_err());
        let c: Celltype = serde_json::from_str("\"silk\"").unwrap();
        assert_eq!(c, Celltype::Mixed);
        assert_eq!(serde_json::to_string(&Celltype::Bool).unwrap(), "\"bool\"");
    }

    #[test]
    fn indices_are_dense() {
        assert_eq!(Celltype::COUNT, 14);
        for (i, celltype) in Celltype::all().enumerate() {
            assert_eq!(celltype.index(), i);
        }
    }
}
