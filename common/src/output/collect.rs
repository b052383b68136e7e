use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, TaskError};
use crate::task::TaskContext;

use super::resolve::resolve;
use super::spec::{OutputSpec, OutputType};

/// Files matched by one output declaration, absolute paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOutput {
    /// Position of the declaration in the task's output list.
    pub index: usize,
    pub files: Vec<PathBuf>,
}

/// Resolves every declaration and matches it against the work directory.
/// A non-optional declaration that matches nothing is a `MissingOutput`.
pub fn collect_outputs(
    specs: &[OutputSpec],
    ctx: &TaskContext,
    work_dir: &Path,
    staged: &[PathBuf],
) -> Result<Vec<ResolvedOutput>> {
    if !work_dir.is_dir() {
        return Err(TaskError::storage(
            work_dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "work directory is gone"),
        ));
    }

    let mut out = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let patterns = resolve(spec, ctx, work_dir)?;
        if patterns.is_empty() && !spec.options.optional {
            return Err(TaskError::MissingOutput {
                pattern: spec.target.to_string(),
            });
        }

        let mut files = Vec::new();
        for pattern in &patterns {
            let found = collect_pattern(spec, pattern, work_dir, staged)?;
            if found.is_empty() && !spec.options.optional {
                return Err(TaskError::MissingOutput {
                    pattern: pattern.clone(),
                });
            }
            files.extend(found);
        }
        debug!("output #{} matched {} file(s)", index, files.len());
        out.push(ResolvedOutput { index, files });
    }
    Ok(out)
}

/// Matches one resolved pattern against the files under `work_dir`.
pub fn collect_pattern(
    spec: &OutputSpec,
    pattern: &str,
    work_dir: &Path,
    staged: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let opts = &spec.options;
    if !opts.glob || !has_wildcard(pattern) {
        let literal = if opts.glob {
            unescape(pattern)
        } else {
            pattern.to_string()
        };
        let candidate = work_dir.join(&literal);
        return Ok(if exists_as(&candidate, opts.kind, opts.follow_links) {
            vec![candidate]
        } else {
            Vec::new()
        });
    }

    let compiled = Pattern::new(&to_pattern_syntax(pattern))
        .map_err(|e| TaskError::InvalidOutputSpec(format!("bad glob `{pattern}`: {e}")))?;
    let match_opts = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: !opts.hidden,
    };

    let mut depth = opts.max_depth.unwrap_or(usize::MAX);
    if !pattern.contains("**") {
        depth = depth.min(Path::new(pattern).components().count());
    }

    let mut found = Vec::new();
    let walker = WalkDir::new(work_dir)
        .min_depth(1)
        .max_depth(depth)
        .follow_links(opts.follow_links);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry under {}: {}", work_dir.display(), e);
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(work_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if !compiled.matches_path_with(rel, match_opts) {
            continue;
        }
        if !opts.include_inputs && staged.iter().any(|s| s == rel) {
            continue;
        }
        let ft = entry.file_type();
        let type_ok = match opts.kind {
            OutputType::Any => true,
            OutputType::File => !ft.is_dir(),
            OutputType::Dir => ft.is_dir(),
        };
        if type_ok {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

fn exists_as(path: &Path, kind: OutputType, follow_links: bool) -> bool {
    let meta = if follow_links {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    };
    match meta {
        Ok(m) => match kind {
            OutputType::Any => true,
            OutputType::File => !m.is_dir(),
            OutputType::Dir => m.is_dir(),
        },
        Err(_) => false,
    }
}

/// True when the pattern has an unescaped wildcard.
fn has_wildcard(pattern: &str) -> bool {
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '*' | '?' | '[' => return true,
            _ => {}
        }
    }
    false
}

fn unescape(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next().unwrap_or('\\'));
        } else {
            out.push(c);
        }
    }
    out
}

// The glob crate has no backslash escapes; escaped wildcards become
// single-character classes.
fn to_pattern_syntax(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(n @ ('*' | '?' | '[' | ']')) => {
                out.push('[');
                out.push(n);
                out.push(']');
            }
            Some(n) => out.push(n),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{escape_glob, OutputOptions, OutputSpec};
    use std::fs;
    use tempfile::tempdir;

    fn touch(dir: &Path, rel: &str) {
        let p = dir.join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(p, "x").unwrap();
    }

    fn names(dir: &Path, files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.strip_prefix(dir).unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn glob_skips_hidden_files_by_default() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        touch(dir.path(), ".b.txt");
        touch(dir.path(), "c.log");

        let spec = OutputSpec::path("*.txt");
        let found = collect_pattern(&spec, "*.txt", dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["a.txt"]);

        let hidden = spec.clone().with_options(OutputOptions {
            hidden: true,
            ..Default::default()
        });
        let found = collect_pattern(&hidden, "*.txt", dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec![".b.txt", "a.txt"]);
    }

    #[test]
    fn glob_respects_max_depth() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "top.txt");
        touch(dir.path(), "d1/mid.txt");
        touch(dir.path(), "d1/d2/deep.txt");

        let spec = OutputSpec::path("**/*.txt");
        let all = collect_pattern(&spec, "**/*.txt", dir.path(), &[]).unwrap();
        assert_eq!(all.len(), 3);

        let shallow = spec.with_options(OutputOptions {
            max_depth: Some(2),
            ..Default::default()
        });
        let found = collect_pattern(&shallow, "**/*.txt", dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["d1/mid.txt", "top.txt"]);
    }

    #[test]
    fn glob_excludes_staged_inputs_unless_asked() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "in.fq");
        touch(dir.path(), "out.fq");
        let staged = vec![PathBuf::from("in.fq")];

        let spec = OutputSpec::path("*.fq");
        let found = collect_pattern(&spec, "*.fq", dir.path(), &staged).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["out.fq"]);

        let with_inputs = spec.with_options(OutputOptions {
            include_inputs: true,
            ..Default::default()
        });
        let found = collect_pattern(&with_inputs, "*.fq", dir.path(), &staged).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["in.fq", "out.fq"]);
    }

    #[test]
    fn glob_filters_by_type() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "res_a");
        fs::create_dir(dir.path().join("res_dir")).unwrap();

        let files = OutputSpec::path("res*").with_options(OutputOptions {
            kind: OutputType::File,
            ..Default::default()
        });
        let found = collect_pattern(&files, "res*", dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["res_a"]);

        let dirs = OutputSpec::path("res*").with_options(OutputOptions {
            kind: OutputType::Dir,
            ..Default::default()
        });
        let found = collect_pattern(&dirs, "res*", dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["res_dir"]);
    }

    #[test]
    fn escaped_wildcards_match_literally() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "weird*.txt");
        touch(dir.path(), "weirdo.txt");

        let spec = OutputSpec::path("x");
        let pattern = escape_glob("weird*.txt");
        let found = collect_pattern(&spec, &pattern, dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["weird*.txt"]);
    }

    #[test]
    fn literal_without_glob() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a[1].txt");

        let spec = OutputSpec::path("a[1].txt").with_options(OutputOptions {
            glob: false,
            ..Default::default()
        });
        let found = collect_pattern(&spec, "a[1].txt", dir.path(), &[]).unwrap();
        assert_eq!(names(dir.path(), &found), vec!["a[1].txt"]);
    }

    #[test]
    fn missing_required_output() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        let specs = vec![OutputSpec::path("a.txt"), OutputSpec::path("b.txt")];
        let err = collect_outputs(&specs, &TaskContext::new(), dir.path(), &[]).unwrap_err();
        assert!(matches!(err, TaskError::MissingOutput { ref pattern } if pattern == "b.txt"));
    }

    #[test]
    fn optional_output_may_be_absent() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        let specs = vec![
            OutputSpec::path("a.txt"),
            OutputSpec::path("*.bam").with_options(OutputOptions {
                optional: true,
                ..Default::default()
            }),
        ];
        let out = collect_outputs(&specs, &TaskContext::new(), dir.path(), &[]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].files, vec![dir.path().join("a.txt")]);
        assert!(out[1].files.is_empty());
    }

    #[test]
    fn legacy_list_collects_each_name() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        touch(dir.path(), "b.txt");
        let specs = vec![OutputSpec::file("a.txt:b.txt")];
        let out = collect_outputs(&specs, &TaskContext::new(), dir.path(), &[]).unwrap();
        assert_eq!(
            out[0].files,
            vec![dir.path().join("a.txt"), dir.path().join("b.txt")]
        );
    }

    #[test]
    fn illegal_path_surfaces_from_collection() {
        let dir = tempdir().unwrap();
        let specs = vec![OutputSpec::path("/etc/passwd")];
        let err = collect_outputs(&specs, &TaskContext::new(), dir.path(), &[]).unwrap_err();
        assert!(matches!(err, TaskError::IllegalOutputPath { .. }));
    }

    #[test]
    fn pattern_helpers() {
        assert!(has_wildcard("*.txt"));
        assert!(has_wildcard("a/b?"));
        assert!(!has_wildcard("a\\*.txt"));
        assert!(!has_wildcard("plain.txt"));
        assert_eq!(unescape("a\\*b\\[c"), "a*b[c");
        assert_eq!(to_pattern_syntax("a\\*b\\{c"), "a[*]b{c");
    }
}
