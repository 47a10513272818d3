//! Path validation and canonicalization.
//!
//! Parses paths like `/room/kitchen/light` into a structured [`TreePath`].
//! A path is absolute, its components are never empty, `.` or `..`, and a
//! single trailing `/` is tolerated. [`PathPattern`] extends the syntax
//! with `*` components for subscription targets such as
//! `/room/*/color/value`.

use std::fmt;

use crate::error::TreeError;


/// A canonical absolute path. The root has no components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TreePath {
    components: Vec<String>,
}

impl TreePath {
    /// The root path `/`.
    pub fn root() -> Self {
        TreePath { components: Vec::new() }
    }

    /// Parse and canonicalize a path string.
    ///
    /// Fails `MalformedPath` for relative paths, empty interior segments,
    /// and any `.` or `..` segment (which also rules out escaping the root).
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        let rest = input
            .strip_prefix('/')
            .ok_or_else(|| TreeError::malformed(input, "path must start with '/'"))?;
        let rest = if rest.len() > 1 {
            rest.strip_suffix('/').unwrap_or(rest)
        } else {
            rest
        };
        if rest.is_empty() {
            return Ok(TreePath::root());
        }

        let mut components = Vec::new();
        for part in rest.split('/') {
            match part {
                "" => return Err(TreeError::malformed(input, "empty path component")),
                "." | ".." => {
                    return Err(TreeError::malformed(
                        input,
                        &format!("'{}' is not allowed", part),
                    ))
                }
                name => components.push(name.to_string()),
            }
        }
        Ok(TreePath { components })
    }

    /// Extend this path by one validated component.
    pub fn join(&self, name: &str) -> Result<TreePath, TreeError> {
        validate_component(name)?;
        let mut components = self.components.clone();
        components.push(name.to_string());
        Ok(TreePath { components })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// The last component, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// The enclosing path, `None` for the root.
    pub fn parent(&self) -> Option<TreePath> {
        if self.is_root() {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(TreePath { components })
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for c in &self.components {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}


/// Check that `name` can be a single path component.
pub fn validate_component(name: &str) -> Result<(), TreeError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(TreeError::InvalidPathComponent {
            component: name.to_string(),
        });
    }
    Ok(())
}


// ---------------------------------------------------------------------------
// PathPattern
// ---------------------------------------------------------------------------

/// A single component of a [`PathPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Exact name match.
    Literal(String),
    /// `*` matches any single name.
    Wildcard,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Literal(s) => f.write_str(s),
            PathSegment::Wildcard => f.write_str("*"),
        }
    }
}


/// An absolute path whose components may be `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    pub segments: Vec<PathSegment>,
}

impl PathPattern {
    /// Parse `/room/*/color`. Same rules as [`TreePath::parse`], plus `*`.
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        let path = TreePath::parse(input)?;
        let segments = path
            .components
            .into_iter()
            .map(|c| {
                if c == "*" {
                    PathSegment::Wildcard
                } else {
                    PathSegment::Literal(c)
                }
            })
            .collect();
        Ok(PathPattern { segments })
    }

    /// True if any component is a wildcard.
    pub fn is_pattern(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, PathSegment::Wildcard))
    }

    /// Match a concrete path component-for-component.
    pub fn matches(&self, path: &TreePath) -> bool {
        match_segments(&self.segments, path.components())
    }

    /// Match an attribute address: the node path against every segment but
    /// the last, and the attribute name against the last.
    pub fn matches_attribute(&self, path: &TreePath, attribute: &str) -> bool {
        match self.segments.split_last() {
            Some((last, prefix)) => {
                match_segments(std::slice::from_ref(last), &[attribute.to_string()])
                    && match_segments(prefix, path.components())
            }
            None => false,
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}


fn match_segments(pattern: &[PathSegment], concrete: &[String]) -> bool {
    if pattern.len() != concrete.len() {
        return false;
    }
    pattern.iter().zip(concrete).all(|(seg, name)| match seg {
        PathSegment::Wildcard => true,
        PathSegment::Literal(expected) => expected == name,
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
