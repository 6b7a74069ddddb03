//! Glob compilation and the auto-queue predicate (§4.3), grounded in the
//! pack's `globset`-based filter patterns rather than hand-rolled matching.

use globset::{GlobBuilder, GlobMatcher};

use crate::models::file_record::SideMeta;
use crate::models::job::AutoQueueConfig;

pub struct CompiledMatcher {
    matcher: GlobMatcher,
    pub is_include: bool,
}

/// Compile a pattern's glob using only `*`, `?`, `.` semantics (§8 boundary
/// behavior), case-insensitively unless `case_sensitive`.
pub fn compile(pattern: &str, is_include: bool, case_sensitive: bool) -> anyhow::Result<CompiledMatcher> {
    let glob = GlobBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()?;
    Ok(CompiledMatcher {
        matcher: glob.compile_matcher(),
        is_include,
    })
}

pub fn compile_all(patterns: &[String], is_include: bool, case_sensitive: bool) -> Vec<CompiledMatcher> {
    patterns
        .iter()
        .filter_map(|p| compile(p, is_include, case_sensitive).ok())
        .collect()
}

fn extension_of(name: &str) -> Option<String> {
    name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

/// §4.3: all conjuncts must hold for a `remote_only` file to be auto-enqueued.
pub fn matches_auto_queue(
    filename: &str,
    relative_path: &str,
    remote: &SideMeta,
    config: &AutoQueueConfig,
) -> bool {
    if !config.enabled {
        return false;
    }

    if let Some(size) = remote.size {
        if let Some(min) = config.min_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = config.max_size {
            if size > max {
                return false;
            }
        }
    }

    let ext = extension_of(filename);
    if !config.include_extensions.is_empty() {
        let include_lower: Vec<String> = config.include_extensions.iter().map(|e| e.to_lowercase()).collect();
        match &ext {
            Some(e) if include_lower.contains(e) => {}
            _ => return false,
        }
    }
    if !config.exclude_extensions.is_empty() {
        let exclude_lower: Vec<String> = config.exclude_extensions.iter().map(|e| e.to_lowercase()).collect();
        if let Some(e) = &ext {
            if exclude_lower.contains(e) {
                return false;
            }
        }
    }

    let includes = compile_all(&config.include_patterns, true, config.case_sensitive);
    let excludes = compile_all(&config.exclude_patterns, false, config.case_sensitive);

    for matcher in includes.iter().chain(excludes.iter()) {
        let hit = matcher.matcher.is_match(filename) || matcher.matcher.is_match(relative_path);
        if matcher.is_include && !hit {
            return false;
        }
        if !matcher.is_include && hit {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> SideMeta {
        SideMeta { exists: true, size: Some(size), mtime: Some(0), is_directory: Some(false) }
    }

    #[test]
    fn auto_queue_filtering_scenario() {
        // Scenario 4 (§8): patterns=[*.mkv], excludes=[*.tmp,*.part], min=1MB, max=5GB.
        let config = AutoQueueConfig {
            enabled: true,
            include_patterns: vec!["*.mkv".into()],
            exclude_patterns: vec!["*.tmp".into(), "*.part".into()],
            min_size: Some(1_000_000),
            max_size: Some(5_000_000_000),
            include_extensions: vec![],
            exclude_extensions: vec![],
            case_sensitive: false,
        };

        assert!(!matches_auto_queue("m.tmp", "m.tmp", &meta(1_000), &config));
        assert!(matches_auto_queue("m.mkv", "m.mkv", &meta(2_000_000_000), &config));
        assert!(!matches_auto_queue("m.part", "m.part", &meta(3_000_000), &config));
    }

    #[test]
    fn case_insensitive_by_default() {
        let config = AutoQueueConfig {
            enabled: true,
            include_patterns: vec!["*.MKV".into()],
            exclude_patterns: vec![],
            min_size: None,
            max_size: None,
            include_extensions: vec![],
            exclude_extensions: vec![],
            case_sensitive: false,
        };
        assert!(matches_auto_queue("movie.mkv", "movie.mkv", &meta(10), &config));
    }
}
