//! Include/exclude path filtering
//!
//! Patterns are mount-relative and never carry the mount prefix:
//! - `foo` matches exactly `foo`
//! - `foo/*` matches any single segment under `foo`
//! - `foo/**` matches any depth under `foo`
//! - `*abc*` matches a substring at root depth
//!
//! A path is included iff it matches at least one replicate pattern and no
//! ignore pattern.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled include/exclude matcher. Pure: the same `(path, patterns)` input
/// always yields the same verdict.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    /// Compile the configured pattern lists. Pattern order is irrelevant.
    pub fn new(replicate: &[String], ignore: &[String]) -> Result<Self, globset::Error> {
        Ok(Self {
            include: build_set(replicate)?,
            exclude: build_set(ignore)?,
        })
    }

    /// Whether `path` should be replicated.
    pub fn matches(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // literal_separator keeps `*` within one path segment so only `**`
        // crosses segments.
        builder.add(
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()?,
        );
    }
    builder.build()
}
