use std::fmt::{Display, Formatter};

/// One step from a composite control to one of its children.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    /// Index this segment selects in an array. Numeric keys count, so
    /// `"2"` and `Index(2)` address the same element.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Key(key) => key.parse().ok(),
        }
    }

    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Key(key) => key.clone(),
            PathSegment::Index(index) => index.to_string(),
        }
    }
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Key(value.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        PathSegment::Key(value)
    }
}

impl From<&String> for PathSegment {
    fn from(value: &String) -> Self {
        PathSegment::Key(value.clone())
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        PathSegment::Index(value)
    }
}

/// Route from a control down to one of its descendants, always relative to
/// the control it is resolved against. The empty path names that control.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ControlPath(Vec<PathSegment>);

impl ControlPath {
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parses a dot-delimited path such as `"address.zip"` or `"items.0"`.
    /// Empty pieces are skipped, so `""` is the empty path.
    pub fn parse(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|piece| !piece.is_empty())
                .map(PathSegment::from)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn child(mut self, segment: impl Into<PathSegment>) -> Self {
        self.0.push(segment.into());
        self
    }
}

impl Display for ControlPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (position, segment) in self.0.iter().enumerate() {
            if position > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<&str> for ControlPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for ControlPath {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<usize> for ControlPath {
    fn from(value: usize) -> Self {
        Self(vec![PathSegment::Index(value)])
    }
}

impl From<&ControlPath> for ControlPath {
    fn from(value: &ControlPath) -> Self {
        value.clone()
    }
}

impl From<Vec<PathSegment>> for ControlPath {
    fn from(value: Vec<PathSegment>) -> Self {
        Self(value)
    }
}

impl From<Vec<String>> for ControlPath {
    fn from(value: Vec<String>) -> Self {
        Self(value.into_iter().map(PathSegment::Key).collect())
    }
}

impl From<&[String]> for ControlPath {
    fn from(value: &[String]) -> Self {
        Self(value.iter().map(PathSegment::from).collect())
    }
}

impl From<&[&str]> for ControlPath {
    fn from(value: &[&str]) -> Self {
        Self(value.iter().copied().map(PathSegment::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ControlPath {
    fn from(value: [&str; N]) -> Self {
        Self(value.into_iter().map(PathSegment::from).collect())
    }
}

impl<const N: usize> From<[PathSegment; N]> for ControlPath {
    fn from(value: [PathSegment; N]) -> Self {
        Self(value.into())
    }
}

impl FromIterator<PathSegment> for ControlPath {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
